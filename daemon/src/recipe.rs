use crate::models::Package;
use crate::pkgfile::PkgFile;
use crate::proc;
use crate::source::SourceHost;
use pkgbuilderd_common::errors::*;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::fs;

pub const RECIPE_FILENAME: &str = "PKGBUILD";

const MAKEPKG_TIMEOUT: u64 = 10 * 60;
const SUBSTITUTION_PASSES: usize = 3;

/// Field name to `(old, new)` value.
pub type Changes = BTreeMap<String, (String, String)>;

/// The declarative fields of a build recipe.
///
/// Only top-level `key=value` and `key=(...)` assignments are read, the first
/// assignment of a key wins. `$var` and `${var}` are replaced with other
/// fields of the same recipe, nothing else is evaluated.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Recipe {
    text: String,
    strings: HashMap<String, String>,
    lists: HashMap<String, Vec<String>>,
}

fn is_identifier(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => (),
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Split shell words, stopping at an unquoted `)` or `#`.
/// Returns the words and whether a closing paren was seen.
fn split_words(s: &str) -> (Vec<String>, bool) {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut quote = None;
    let mut closed = false;

    for c in s.chars() {
        if let Some(q) = quote {
            if c == q {
                quote = None;
            } else {
                current.push(c);
            }
            continue;
        }

        match c {
            '\'' | '"' => {
                quote = Some(c);
                quoted = true;
            }
            '#' if current.is_empty() && !quoted => break,
            ')' => {
                closed = true;
                break;
            }
            c if c.is_whitespace() => {
                if !current.is_empty() || quoted {
                    words.push(std::mem::take(&mut current));
                }
                quoted = false;
            }
            c => current.push(c),
        }
    }

    if !current.is_empty() || quoted {
        words.push(current);
    }

    (words, closed)
}

fn substitute(value: &str, vars: &HashMap<String, String>) -> String {
    let mut out = String::new();
    let mut rest = value;

    while let Some(idx) = rest.find('$') {
        out.push_str(&rest[..idx]);
        let after = &rest[idx + 1..];

        let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (&braced[..end], end + 2),
                None => ("", 0),
            }
        } else {
            let len = after.find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            (&after[..len], len)
        };

        match vars.get(name).filter(|_| is_identifier(name)) {
            Some(value) if !value.contains('$') => {
                out.push_str(value);
                rest = &after[consumed..];
            }
            _ => {
                out.push('$');
                rest = after;
            }
        }
    }

    out.push_str(rest);
    out
}

impl Recipe {
    pub fn parse(text: &str) -> Recipe {
        let mut strings = HashMap::new();
        let mut lists = HashMap::<String, Vec<String>>::new();
        let mut open_list: Option<(String, Vec<String>)> = None;

        for raw in text.lines() {
            let line = raw.trim();

            if let Some((key, mut values)) = open_list.take() {
                let (words, closed) = split_words(line);
                values.extend(words);
                if closed {
                    lists.entry(key).or_insert(values);
                } else {
                    open_list = Some((key, values));
                }
                continue;
            }

            // indented assignments belong to function bodies
            if line.is_empty() || line.starts_with('#') || raw.starts_with(char::is_whitespace) {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            if !is_identifier(key) {
                continue;
            }

            if let Some(value) = value.strip_prefix('(') {
                let (words, closed) = split_words(value);
                if closed {
                    lists.entry(key.to_string()).or_insert(words);
                } else {
                    open_list = Some((key.to_string(), words));
                }
            } else {
                let (words, _) = split_words(value);
                let value = words.into_iter().next().unwrap_or_default();
                let value = if value == "None" { String::new() } else { value };
                strings.entry(key.to_string()).or_insert(value);
            }
        }

        // an unterminated list still counts
        if let Some((key, values)) = open_list {
            lists.entry(key).or_insert(values);
        }

        for values in lists.values_mut() {
            values.retain(|v| !v.is_empty());
        }

        let mut recipe = Recipe {
            text: text.to_string(),
            strings,
            lists,
        };
        recipe.resolve_references();
        recipe
    }

    fn resolve_references(&mut self) {
        if self.strings.get("pkgver").map(|v| v.is_empty()).unwrap_or(true) {
            if let Some(pkgver) = self.strings.get("_pkgver").cloned() {
                self.strings.insert("pkgver".to_string(), pkgver);
            }
        }

        let mut vars = self.strings.clone();
        if let Some([pkgname]) = self.lists.get("pkgname").map(|v| v.as_slice()) {
            vars.entry("pkgname".to_string()).or_insert_with(|| pkgname.clone());
        }

        for _ in 0..SUBSTITUTION_PASSES {
            let mut changed = false;
            for value in self.strings.values_mut() {
                if value.contains('$') {
                    let new = substitute(value, &vars);
                    if new != *value {
                        *value = new;
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
            vars.extend(self.strings.iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        for values in self.lists.values_mut() {
            for value in values.iter_mut() {
                if value.contains('$') {
                    *value = substitute(value, &vars);
                }
            }
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// A string field, empty if missing. List fields are joined with spaces.
    pub fn get_field(&self, name: &str) -> String {
        if let Some(value) = self.strings.get(name) {
            value.clone()
        } else if let Some(values) = self.lists.get(name) {
            values.join(" ")
        } else {
            String::new()
        }
    }

    /// A list field in declaration order. A string field becomes a single
    /// item list.
    pub fn get_list_field(&self, name: &str) -> Vec<String> {
        if let Some(values) = self.lists.get(name) {
            values.clone()
        } else {
            match self.strings.get(name) {
                Some(value) if !value.is_empty() => vec![value.clone()],
                _ => Vec::new(),
            }
        }
    }

    pub fn get_bool(&self, name: &str) -> bool {
        matches!(self.get_field(name).as_str(), "True" | "true" | "yes" | "1")
    }

    pub fn get_opt(&self, name: &str) -> Option<String> {
        Some(self.get_field(name)).filter(|v| !v.is_empty())
    }

    /// Dependency names without version constraints.
    pub fn dependency_names(&self, field: &str) -> BTreeSet<String> {
        self.get_list_field(field)
            .into_iter()
            .filter_map(|dep| {
                let name = dep.split(|c| c == '<' || c == '>' || c == '=' || c == ':')
                    .next()
                    .unwrap_or_default()
                    .trim()
                    .to_string();
                Some(name).filter(|n| !n.is_empty())
            })
            .collect()
    }

    pub fn is_split(&self) -> bool {
        self.strings.contains_key("pkgbase") || self.get_list_field("pkgname").len() > 1
    }

    pub fn split_packages(&self, name: &str) -> Vec<String> {
        self.get_list_field("pkgname")
            .into_iter()
            .filter(|n| n != name)
            .collect()
    }
}

/// Rewrite `field=old` to `field=new` for every change. Fields with
/// `monitored` in their name are matched in their single quoted form. A
/// `pkgver` change also resets `pkgrel` to 1 unless `pkgrel` is part of the
/// changes itself.
pub fn apply_changes(text: &str, changes: &Changes, current_pkgrel: &str) -> String {
    let mut text = text.to_string();

    for (key, (old, new)) in changes {
        let (search, replace) = if key.contains("monitored") {
            (format!("{}='{}'", key, old), format!("{}='{}'", key, new))
        } else {
            (format!("{}={}", key, old), format!("{}={}", key, new))
        };

        if key.contains("sums") && !old.is_empty() && text.contains(old.as_str()) {
            text = text.replace(old.as_str(), new);
        }

        text = text.replace(&search, &replace);

        if key == "pkgver" && current_pkgrel != "1" && !changes.contains_key("pkgrel") {
            text = text.replace(&format!("pkgrel={}", current_pkgrel), "pkgrel=1");
        }
    }

    text
}

/// The next `pkgrel`, `2` after `1` and `3` after `2.1`.
pub fn bump_pkgrel(pkgrel: &str) -> Result<String> {
    let major = pkgrel.split('.').next().unwrap_or_default();
    let major = major.parse::<u64>()
        .with_context(|| anyhow!("Invalid pkgrel: {:?}", pkgrel))?;
    Ok((major + 1).to_string())
}

fn is_valid_version(version: &str) -> bool {
    version.len() > 2 && !version.contains("None") && !version.contains('$')
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecipeLocation {
    /// Directory holding the recipe inside the checkout.
    pub dir: PathBuf,
    /// Path of the recipe file on the source host.
    pub remote_path: String,
}

/// Recipes inside a checkout of the recipe tree.
#[derive(Debug, Clone)]
pub struct RecipeTree {
    root: PathBuf,
    packages_root: String,
    recipe_dirs: Vec<String>,
}

impl RecipeTree {
    pub fn new(checkout: &Path, packages_root: &str, recipe_dirs: Vec<String>) -> RecipeTree {
        let packages_root = packages_root.trim_matches('/').to_string();
        RecipeTree {
            root: checkout.join(&packages_root),
            packages_root,
            recipe_dirs,
        }
    }

    pub fn locate(&self, name: &str) -> Result<RecipeLocation> {
        for sub in &self.recipe_dirs {
            let dir = self.root.join(sub).join(name);
            if dir.join(RECIPE_FILENAME).is_file() {
                let remote_path = [self.packages_root.as_str(), sub.as_str(), name, RECIPE_FILENAME]
                    .iter()
                    .filter(|p| !p.is_empty())
                    .copied()
                    .collect::<Vec<_>>()
                    .join("/");
                return Ok(RecipeLocation { dir, remote_path });
            }
        }
        bail!("Could not find a recipe for {:?} in {:?}", name, self.root)
    }

    pub async fn load(&self, name: &str) -> Result<(RecipeLocation, Recipe)> {
        let location = self.locate(name)?;
        let path = location.dir.join(RECIPE_FILENAME);
        let text = fs::read_to_string(&path).await
            .with_context(|| anyhow!("Failed to read recipe: {:?}", path))?;
        Ok((location, Recipe::parse(&text)))
    }
}

/// Finds, reads and updates recipes in a checkout of the recipe tree.
pub struct SourceResolver {
    tree: RecipeTree,
    host: Arc<dyn SourceHost>,
    makepkg: PathBuf,
    last_commit: Mutex<Option<String>>,
}

impl SourceResolver {
    pub fn new(tree: RecipeTree, host: Arc<dyn SourceHost>) -> SourceResolver {
        SourceResolver {
            tree,
            host,
            makepkg: PathBuf::from("/usr/bin/makepkg"),
            last_commit: Mutex::new(None),
        }
    }

    /// The commit of the most recent recipe update pushed through this
    /// resolver, if any.
    pub fn last_commit(&self) -> Option<String> {
        self.last_commit.lock()
            .unwrap_or_else(|err| err.into_inner())
            .clone()
    }

    pub async fn load(&self, name: &str) -> Result<(RecipeLocation, Recipe)> {
        self.tree.load(name).await
    }

    /// Copy recipe metadata into the package record. Defaults that only
    /// apply to a new package are set once.
    pub fn sync_package(&self, pkg: &mut Package, location: &RecipeLocation, recipe: &Recipe, default_repos: &[String]) {
        if !pkg.is_initialized {
            let allowed_in = recipe.get_list_field("_allowed_in");
            pkg.allowed_in = if allowed_in.is_empty() {
                default_repos.to_vec()
            } else {
                allowed_in
            };
            pkg.is_metapkg = recipe.get_bool("_is_metapkg");
            pkg.is_initialized = true;
        }

        pkg.is_split = recipe.is_split();
        pkg.split_packages = if pkg.is_split {
            recipe.split_packages(&pkg.name)
        } else {
            Vec::new()
        };

        pkg.pkgdesc = recipe.get_field("pkgdesc");
        pkg.url = recipe.get_field("url");
        pkg.auto_sum = recipe.get_bool("_auto_sum") || recipe.get_bool("_autosums");
        pkg.depends = recipe.dependency_names("depends");
        pkg.makedepends = recipe.dependency_names("makedepends");

        pkg.is_monitored = recipe.get_bool("_is_monitored");
        if pkg.is_monitored {
            pkg.mon_service = recipe.get_opt("_monitored_service");
            pkg.mon_type = recipe.get_opt("_monitored_type");
            pkg.mon_project = recipe.get_opt("_monitored_project");
            pkg.mon_repo = recipe.get_opt("_monitored_repo");
            pkg.mon_match_pattern = recipe.get_opt("_monitored_match_pattern");
        }

        pkg.recipe_path = Some(location.remote_path.clone());
        pkg.recipe = Some(recipe.text().to_string());
    }

    /// Rewrite the given fields of a package's recipe and commit it.
    ///
    /// Returns false if the push is refused or fails. If the recipe already
    /// contains the new values nothing is committed and true is returned.
    pub async fn push_field_update(&self, pkg: &Package, changes: &Changes) -> Result<bool> {
        let can_push = changes.keys().any(|k| k.contains("monitored"))
            || pkg.push_version
            || pkg.is_monitored
            || changes.contains_key("pkgrel");

        let invalid = changes.values()
            .any(|(old, new)| new.is_empty() || new == "None" || old == new);

        if changes.is_empty() || invalid || !can_push {
            error!("Refusing to push recipe changes for {:?}: {:?}", pkg.name, changes);
            return Ok(false);
        }

        let Some(remote_path) = pkg.recipe_path.as_deref() else {
            error!("No recipe path known for {:?}", pkg.name);
            return Ok(false);
        };

        let file = match self.host.read_file(remote_path).await {
            Ok(file) => file,
            Err(err) => {
                error!("Failed to fetch recipe for {:?}: {:#}", pkg.name, err);
                return Ok(false);
            }
        };

        let current_pkgrel = Recipe::parse(&file.content).get_field("pkgrel");
        let content = apply_changes(&file.content, changes, &current_pkgrel);
        if content == file.content {
            debug!("Recipe for {:?} is already up to date", pkg.name);
            return Ok(true);
        }

        let message = match changes.get("pkgver") {
            Some((_, new)) if !pkg.auto_sum => format!("[pkgbuilderd] updpkg {} {}", pkg.name, new),
            _ => format!("[pkgbuilderd] Updated recipe for {}.", pkg.name),
        };

        match self.host.update_file(remote_path, &content, &file.sha, &message).await {
            Ok(commit) => {
                info!("Pushed recipe update for {:?}: {}", pkg.name, commit);
                *self.last_commit.lock().unwrap_or_else(|err| err.into_inner()) = Some(commit);
            }
            Err(err) => {
                error!("Failed to push recipe update for {:?}: {:#}", pkg.name, err);
                return Ok(false);
            }
        }

        if let Ok(location) = self.tree.locate(&pkg.name) {
            let path = location.dir.join(RECIPE_FILENAME);
            fs::write(&path, &content).await
                .with_context(|| anyhow!("Failed to write recipe: {:?}", path))?;
        }

        Ok(true)
    }

    async fn commit_pseudo_version(&self, dir: &Path) -> Result<String> {
        let opts = proc::Options::new(Duration::from_secs(MAKEPKG_TIMEOUT)).cwd(dir);
        let (success, output) = proc::run_capture(&self.makepkg, &["--packagelist"], opts).await?;
        if !success {
            bail!("makepkg --packagelist failed: {}", output.trim());
        }

        let first = output.lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .context("makepkg --packagelist returned nothing")?;
        let filename = Path::new(first)
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .context("Invalid package path")?;
        Ok(PkgFile::parse(&filename)?.pkgver)
    }

    /// Determine the version this package is going to be built as and store
    /// it in the version fields of `pkg`.
    ///
    /// Unmonitored packages take their version from the recipe, packages
    /// monitored for releases take the last monitor result, commit monitored
    /// packages ask makepkg. A version equal to the stored one gets its
    /// pkgrel bumped and pushed.
    pub async fn resolve_version(&self, pkg: &mut Package, location: &RecipeLocation, recipe: &Recipe) -> Result<String> {
        let mon_type = pkg.mon_type.as_deref().unwrap_or_default();
        let from_tag = pkg.is_monitored && ["releases", "tags", "file"].contains(&mon_type);
        let from_commit = pkg.is_monitored && mon_type == "commits";

        let mut changed = BTreeMap::<&str, String>::new();

        if from_commit {
            let pkgver = self.commit_pseudo_version(&location.dir).await
                .with_context(|| anyhow!("Failed to determine commit version of {:?}", pkg.name))?;
            changed.insert("pkgver", pkgver);
            changed.insert("pkgrel", "1".to_string());
        } else if let (true, Some(result)) = (from_tag, pkg.mon_last_result.clone()) {
            if result != pkg.pkgver {
                changed.insert("pkgver", result);
                changed.insert("pkgrel", "1".to_string());
            }
        } else {
            if from_tag {
                pkg.mon_last_result = recipe.get_opt("pkgver");
            }
            for key in ["epoch", "pkgver", "pkgrel"] {
                let new = recipe.get_field(key);
                let old = match key {
                    "epoch" => pkg.epoch.clone().unwrap_or_default(),
                    "pkgver" => pkg.pkgver.clone(),
                    _ => pkg.pkgrel.clone(),
                };

                if new.is_empty() {
                    if key != "epoch" {
                        info!("Unable to get {} from recipe of {:?}", key, pkg.name);
                    }
                } else if new != old || !pkg.version_str.contains(new.as_str()) {
                    changed.insert(key, new);
                }
            }
        }

        if changed.is_empty() {
            if is_valid_version(&pkg.version_str) {
                return Ok(pkg.version_str.clone());
            }
            if pkg.pkgver.is_empty() || pkg.pkgrel.is_empty() {
                bail!("Unable to determine version of {:?}", pkg.name);
            }
        }

        // the recipe has to match what is going to be built
        let recipe_pkgver = recipe.get_field("pkgver");
        if let Some(pkgver) = changed.get("pkgver") {
            if !recipe_pkgver.is_empty() && *pkgver != recipe_pkgver && (from_tag || from_commit) {
                let mut changes = Changes::new();
                changes.insert("pkgver".to_string(), (recipe_pkgver.clone(), pkgver.clone()));
                if !self.push_field_update(pkg, &changes).await? {
                    warn!("Failed to push new pkgver for {:?}", pkg.name);
                }
            }
        }

        let same_pkgver = changed.get("pkgver").map(|v| *v == pkg.pkgver).unwrap_or(true);
        let same_pkgrel = changed.get("pkgrel").map(|v| *v == pkg.pkgrel).unwrap_or(true);

        if same_pkgver && same_pkgrel && !pkg.pkgrel.is_empty() {
            let pkgrel = bump_pkgrel(&pkg.pkgrel)?;
            let mut changes = Changes::new();
            changes.insert("pkgrel".to_string(), (pkg.pkgrel.clone(), pkgrel.clone()));
            if !self.push_field_update(pkg, &changes).await? {
                warn!("Failed to push pkgrel bump for {:?}", pkg.name);
            }
            changed.insert("pkgrel", pkgrel);
        }

        for (key, value) in changed {
            match key {
                "epoch" => pkg.epoch = Some(value),
                "pkgver" => pkg.pkgver = value,
                _ => pkg.pkgrel = value,
            }
        }

        let version = pkg.full_version();
        if !is_valid_version(&version) {
            bail!("Invalid version for {:?}: {:?}", pkg.name, version);
        }
        pkg.version_str = version.clone();
        Ok(version)
    }
}
