use crate::fixtures::PACKAGES_ROOT;

pub const DUMMY_PACKAGE: &str = "foo";
pub const DUMMY_LIBRARY: &str = "libfoo";
pub const DUMMY_APPLICATION: &str = "appfoo";

pub fn recipe_path(name: &str) -> String {
    format!("{}/{}/PKGBUILD", PACKAGES_ROOT, name)
}

pub fn subgroup_recipe_path(group: &str, name: &str) -> String {
    format!("{}/{}/{}/PKGBUILD", PACKAGES_ROOT, group, name)
}

pub fn simple_recipe(name: &str, pkgver: &str, depends: &[&str]) -> String {
    let depends = depends.iter()
        .map(|d| format!("'{}'", d))
        .collect::<Vec<_>>()
        .join(" ");
    format!(r#"# Maintainer: Antergos Developers <dev@antergos.com>

pkgname={name}
pkgver={pkgver}
pkgrel=1
pkgdesc="Dummy package {name}"
arch=('x86_64')
url='https://example.com/{name}'
license=('GPL3')
depends=('glibc' {depends})
makedepends=('git')

package() {{
    install -d "${{pkgdir}}/usr/share/{name}"
}}
"#)
}

/// Only allowed into the staging repository.
pub fn staging_only_recipe(name: &str) -> String {
    simple_recipe(name, "1.0", &[])
        .replace("makedepends=('git')", "makedepends=('git')\n_allowed_in=('antergos-staging')")
}

pub fn monitored_recipe(name: &str, pkgver: &str) -> String {
    simple_recipe(name, pkgver, &[])
        .replace("arch=('x86_64')", "arch=('any')")
        + &format!(r#"
_is_monitored='True'
_monitored_service='github'
_monitored_type='releases'
_monitored_project='example'
_monitored_repo='{name}'
"#)
}

pub fn split_recipe(base: &str, children: &[&str]) -> String {
    let names = children.iter()
        .map(|c| format!("'{}'", c))
        .collect::<Vec<_>>()
        .join(" ");
    format!(r#"pkgbase={base}
pkgname=({names})
pkgver=3.2
pkgrel=2
arch=('x86_64')
depends=('glibc')
"#)
}
