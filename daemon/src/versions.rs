use std::cmp::Ordering;
use std::fmt;

/// Compare two version segments the way pacman's `rpmvercmp` does.
fn rpmvercmp(a: &str, b: &str) -> Ordering {
    if a == b {
        return Ordering::Equal;
    }

    let one = a.as_bytes();
    let two = b.as_bytes();
    // start of the unconsumed input
    let (mut i, mut j) = (0, 0);
    // end of the previous segment
    let (mut p1, mut p2) = (0, 0);
    let mut isnum = false;

    while i < one.len() && j < two.len() {
        while i < one.len() && !one[i].is_ascii_alphanumeric() {
            i += 1;
        }
        while j < two.len() && !two[j].is_ascii_alphanumeric() {
            j += 1;
        }

        if i >= one.len() || j >= two.len() {
            break;
        }

        // different separator lengths
        if i - p1 != j - p2 {
            return (i - p1).cmp(&(j - p2));
        }

        p1 = i;
        p2 = j;

        if one[p1].is_ascii_digit() {
            while p1 < one.len() && one[p1].is_ascii_digit() {
                p1 += 1;
            }
            while p2 < two.len() && two[p2].is_ascii_digit() {
                p2 += 1;
            }
            isnum = true;
        } else {
            while p1 < one.len() && one[p1].is_ascii_alphabetic() {
                p1 += 1;
            }
            while p2 < two.len() && two[p2].is_ascii_alphabetic() {
                p2 += 1;
            }
            isnum = false;
        }

        if p2 == j {
            // numeric segments are always newer than alpha segments
            return if isnum { Ordering::Greater } else { Ordering::Less };
        }

        let mut seg1 = &one[i..p1];
        let mut seg2 = &two[j..p2];

        if isnum {
            while seg1.first() == Some(&b'0') {
                seg1 = &seg1[1..];
            }
            while seg2.first() == Some(&b'0') {
                seg2 = &seg2[1..];
            }
            match seg1.len().cmp(&seg2.len()) {
                Ordering::Equal => (),
                other => return other,
            }
        }

        match seg1.cmp(seg2) {
            Ordering::Equal => (),
            other => return other,
        }

        i = p1;
        j = p2;
    }

    let rest1 = one.get(i).copied();
    let rest2 = two.get(j).copied();

    match (rest1, rest2) {
        (None, None) => Ordering::Equal,
        // a remaining alpha string never beats an empty string
        (None, Some(c)) if !c.is_ascii_alphabetic() => Ordering::Less,
        (Some(c), _) if c.is_ascii_alphabetic() => Ordering::Less,
        _ => Ordering::Greater,
    }
}

/// Split `[epoch:]version[-release]`.
fn parse_evr(evr: &str) -> (&str, &str, Option<&str>) {
    let digits = evr.bytes().take_while(|c| c.is_ascii_digit()).count();

    let (epoch, rest) = if evr.as_bytes().get(digits) == Some(&b':') {
        let epoch = &evr[..digits];
        (if epoch.is_empty() { "0" } else { epoch }, &evr[digits + 1..])
    } else {
        ("0", evr)
    };

    match rest.rfind('-') {
        Some(idx) => (epoch, &rest[..idx], Some(&rest[idx + 1..])),
        None => (epoch, rest, None),
    }
}

/// Total order over full package versions, `[epoch:]pkgver[-pkgrel]`.
///
/// The release is only compared if both sides carry one.
pub fn vercmp(a: &str, b: &str) -> Ordering {
    if a == b {
        return Ordering::Equal;
    }

    let (epoch1, ver1, rel1) = parse_evr(a);
    let (epoch2, ver2, rel2) = parse_evr(b);

    rpmvercmp(epoch1, epoch2)
        .then_with(|| rpmvercmp(ver1, ver2))
        .then_with(|| match (rel1, rel2) {
            (Some(rel1), Some(rel2)) => rpmvercmp(rel1, rel2),
            _ => Ordering::Equal,
        })
}

/// A version string ordered with [`vercmp`].
#[derive(Debug, Clone)]
pub struct PkgVersion(pub String);

impl PkgVersion {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PkgVersion {
    fn from(s: &str) -> PkgVersion {
        PkgVersion(s.to_string())
    }
}

impl fmt::Display for PkgVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl PartialEq for PkgVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PkgVersion {}

impl PartialOrd for PkgVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PkgVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        vercmp(&self.0, &other.0)
    }
}

/// The newest of a set of versions.
pub fn latest<'a, I: IntoIterator<Item = &'a str>>(versions: I) -> Option<&'a str> {
    versions.into_iter().max_by(|a, b| vercmp(a, b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use Ordering::*;

    fn check(a: &str, b: &str, expected: Ordering) {
        assert_eq!(vercmp(a, b), expected, "{:?} vs {:?}", a, b);
        assert_eq!(vercmp(b, a), expected.reverse(), "{:?} vs {:?}", b, a);
    }

    #[test]
    fn test_equal() {
        check("1.5.0", "1.5.0", Equal);
        check("1.5.1", "1.5.1", Equal);
        check("1.0-1", "1.0-1", Equal);
        check("01", "1", Equal);
    }

    #[test]
    fn test_simple() {
        check("1.5.0", "1.5.1", Less);
        check("1.5.1", "1.5.2", Less);
        check("1.0", "1.1", Less);
        check("1.9", "1.10", Less);
        check("2.0", "10.0", Less);
    }

    #[test]
    fn test_alpha_segments() {
        check("1.5b", "1.5", Less);
        check("1.5", "1.5.1", Less);
        check("1.5.a", "1.5", Greater);
        check("1.0a", "1.0alpha", Less);
        check("1.0alpha", "1.0b", Less);
        check("1.0b", "1.0beta", Less);
        check("1.0beta", "1.0rc", Less);
        check("1.0rc", "1.0", Less);
        check("1.1a1", "1.111", Less);
    }

    #[test]
    fn test_separators() {
        check("1.0", "1_0", Equal);
        check("1..0", "1.0", Greater);
        check("1.5.0", "1.5", Greater);
    }

    #[test]
    fn test_release() {
        check("1.5-1", "1.5-2", Less);
        check("1.5.0-1", "1.5.0-2", Less);
        check("1.5.0-1", "1.5.1-1", Less);
        check("1.1-1", "1.0-1", Greater);
        // release is ignored unless both sides have one
        check("1.5-1", "1.5", Equal);
        check("1.5-1.1", "1.5-1", Greater);
    }

    #[test]
    fn test_epoch() {
        check("0:1.0", "0:1.0", Equal);
        check("0:1.0", "1.0", Equal);
        check("0:1.0", "1:1.0", Less);
        check("1:1.0", "2.0", Greater);
        check("1:1.0-1", "1:1.0-2", Less);
        check("2:1.0", "10:0.1", Less);
    }

    #[test]
    fn test_latest() {
        assert_eq!(latest(["1.0-1", "1.1-1", "1.0.1-3"]), Some("1.1-1"));
        assert_eq!(latest(["1:0.1-1", "2.0-1"]), Some("1:0.1-1"));
        assert_eq!(latest(Vec::<&str>::new()), None);
    }

    #[test]
    fn test_ord_wrapper() {
        let mut versions = vec![
            PkgVersion::from("1.10-1"),
            PkgVersion::from("1.2-1"),
            PkgVersion::from("1:0.1-1"),
        ];
        versions.sort();
        let sorted = versions.iter().map(|v| v.as_str()).collect::<Vec<_>>();
        assert_eq!(sorted, vec!["1.2-1", "1.10-1", "1:0.1-1"]);
    }
}
