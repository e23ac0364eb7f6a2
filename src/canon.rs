//! Canonical build-target paths.
//!
//! Build targets are identified by their canonicalized path: forward
//! slashes only, no duplicate separators, no interior `.` or `..`
//! segments. On windows the original back-slash positions are kept in
//! a per-separator bit mask so the OS-native spelling can be
//! reconstructed on demand.

use std::borrow::Borrow;
use std::fmt;
use std::hash::{Hash, Hasher};

/// An immutable, canonicalized path used as a stable target identity.
///
/// Equality and hashing consider the canonical string only; the slash
/// bits are metadata for lossy recovery of the native spelling (exact
/// up to 64 separators, after which the top bit stands in for every
/// further one).
#[derive(Clone, Debug, Eq)]
pub struct CanonicalPath {
    path: String,
    slash_bits: u64,
}

impl CanonicalPath {
    /// Canonicalizes `path`.
    ///
    /// An empty input stays empty; a non-empty self-reference such as
    /// `"./"` or `"foo/.."` collapses to `"."`.
    pub fn new(path: &str) -> CanonicalPath {
        let mut buf = path.as_bytes().to_vec();
        let slash_bits = canonicalize(&mut buf, cfg!(windows));
        CanonicalPath {
            // Canonicalization only moves or drops whole components
            // and rewrites ASCII separators, so UTF-8 is preserved.
            path: String::from_utf8(buf).unwrap(),
            slash_bits,
        }
    }

    /// The canonical string, always forward-slash separated.
    pub fn as_str(&self) -> &str {
        &self.path
    }

    /// Which separators were originally back-slashes.
    pub fn slash_bits(&self) -> u64 {
        self.slash_bits
    }

    /// The path in its original separator spelling.
    ///
    /// Separator `i` of the canonical string is written as a
    /// back-slash when bit `i` of the mask is set; every separator
    /// past the 63rd shares bit 63.
    pub fn decanonicalized(&self) -> String {
        let mut out = self.path.clone().into_bytes();
        let mut mask = 1u64;
        for c in out.iter_mut() {
            if *c == b'/' {
                if self.slash_bits & mask != 0 {
                    *c = b'\\';
                }
                if mask != 1 << 63 {
                    mask <<= 1;
                }
            }
        }
        String::from_utf8(out).unwrap()
    }
}

impl PartialEq for CanonicalPath {
    fn eq(&self, other: &CanonicalPath) -> bool {
        self.path == other.path
    }
}

impl Hash for CanonicalPath {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.path.hash(state);
    }
}

impl Borrow<str> for CanonicalPath {
    fn borrow(&self) -> &str {
        &self.path
    }
}

impl fmt::Display for CanonicalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

/// In-place canonicalizer.
///
/// Keeps a stack of component start offsets so `..` can back out of
/// the previous component without rescanning. Separator bytes are
/// copied verbatim; with `windows_rules` a final pass folds
/// back-slashes to forward slashes while recording them in the
/// returned mask.
fn canonicalize(buf: &mut Vec<u8>, windows_rules: bool) -> u64 {
    if buf.is_empty() {
        return 0;
    }

    let sep = |c: u8| c == b'/' || (windows_rules && c == b'\\');

    let len = buf.len();
    let mut components: Vec<usize> = Vec::new();
    let mut src = 0;
    let mut dst = 0;

    // An absolute path keeps its leading separator. A double leading
    // separator is a windows network share and keeps both; elsewhere
    // the loop below collapses the second one.
    if sep(buf[0]) {
        if windows_rules && len > 1 && sep(buf[1]) {
            src = 2;
            dst = 2;
        } else {
            src = 1;
            dst = 1;
        }
    }
    let dst_start = dst;

    while src < len {
        if buf[src] == b'.' {
            if src + 1 == len || sep(buf[src + 1]) {
                // `.` component; eliminate.
                src += 2;
                continue;
            }
            if buf[src + 1] == b'.' && (src + 2 == len || sep(buf[src + 2])) {
                // `..` component. Back up if possible.
                match components.pop() {
                    Some(prev) => {
                        dst = prev;
                        src += 3;
                    }
                    None => {
                        // Nothing to back out of; the `..` survives
                        // literally and is not itself a component a
                        // later `..` may pop.
                        buf[dst] = b'.';
                        buf[dst + 1] = b'.';
                        dst += 2;
                        src += 2;
                        if src < len {
                            buf[dst] = buf[src];
                            dst += 1;
                            src += 1;
                        }
                    }
                }
                continue;
            }
        }

        if sep(buf[src]) {
            src += 1;
            continue;
        }

        components.push(dst);
        while src < len && !sep(buf[src]) {
            buf[dst] = buf[src];
            dst += 1;
            src += 1;
        }
        if src < len {
            // Keep the original separator byte for the slash-bits pass.
            buf[dst] = buf[src];
            dst += 1;
            src += 1;
        }
    }

    if dst > dst_start && sep(buf[dst - 1]) {
        dst -= 1;
    }
    if dst == 0 {
        buf[0] = b'.';
        dst = 1;
    }
    buf.truncate(dst);

    if !windows_rules {
        return 0;
    }

    let mut bits = 0u64;
    let mut mask = 1u64;
    for c in buf.iter_mut() {
        match *c {
            b'\\' => {
                bits |= mask;
                *c = b'/';
                if mask != 1 << 63 {
                    mask <<= 1;
                }
            }
            b'/' => {
                if mask != 1 << 63 {
                    mask <<= 1;
                }
            }
            _ => {}
        }
    }
    bits
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canon(s: &str) -> String {
        let mut buf = s.as_bytes().to_vec();
        canonicalize(&mut buf, false);
        String::from_utf8(buf).unwrap()
    }

    fn canon_win(s: &str) -> (String, u64) {
        let mut buf = s.as_bytes().to_vec();
        let bits = canonicalize(&mut buf, true);
        (String::from_utf8(buf).unwrap(), bits)
    }

    #[test]
    fn path_samples() {
        assert_eq!(canon(""), "");
        assert_eq!(canon("foo.h"), "foo.h");
        assert_eq!(canon("./foo.h"), "foo.h");
        assert_eq!(canon("./foo/./bar.h"), "foo/bar.h");
        assert_eq!(canon("./x/foo/../bar.h"), "x/bar.h");
        assert_eq!(canon("./x/foo/../../bar.h"), "bar.h");
        assert_eq!(canon("foo//bar"), "foo/bar");
        assert_eq!(canon("foo//.//..///bar"), "bar");
        assert_eq!(canon("./x/../foo/../../bar.h"), "../bar.h");
        assert_eq!(canon("foo/./."), "foo");
        assert_eq!(canon("foo/bar/.."), "foo");
        assert_eq!(canon("foo/.hidden_bar"), "foo/.hidden_bar");
        assert_eq!(canon("/foo"), "/foo");
        assert_eq!(canon("//foo"), "/foo");
        assert_eq!(canon("/"), "/");
        assert_eq!(canon("/foo/.."), "/");
        assert_eq!(canon("."), ".");
        assert_eq!(canon("./."), ".");
        assert_eq!(canon("foo/.."), ".");
    }

    #[test]
    fn up_dir_survives_at_the_front() {
        assert_eq!(canon("../foo.h"), "../foo.h");
        assert_eq!(canon("../../foo.h"), "../../foo.h");
        assert_eq!(canon("../a/.."), "..");
        // An absolute path cannot back out of the root.
        assert_eq!(canon("/.."), "/..");
        assert_eq!(canon("/../.."), "/../..");
    }

    #[test]
    fn windows_separators_are_folded_and_recorded() {
        let (path, bits) = canon_win("foo.h");
        assert_eq!(path, "foo.h");
        assert_eq!(bits, 0);

        let (path, bits) = canon_win("a\\foo.h");
        assert_eq!(path, "a/foo.h");
        assert_eq!(bits, 0b1);

        let (path, bits) = canon_win("a/foo.h");
        assert_eq!(path, "a/foo.h");
        assert_eq!(bits, 0);

        let (path, bits) = canon_win("a\\b/c\\./../..\\g/foo.h");
        assert_eq!(path, "a/g/foo.h");
        assert_eq!(bits, 0b0001);

        // Network share keeps its doubled separator.
        let (path, _) = canon_win("//server/share/x");
        assert_eq!(path, "//server/share/x");
    }

    #[test]
    fn slash_bits_saturate_past_64_separators() {
        let deep = "a\\".repeat(70) + "foo.h";
        let (path, bits) = canon_win(&deep);
        assert_eq!(path, "a/".repeat(70) + "foo.h");
        assert_eq!(bits, u64::MAX);

        let p = CanonicalPath {
            path,
            slash_bits: bits,
        };
        assert_eq!(p.decanonicalized(), "a\\".repeat(70) + "foo.h");
    }

    #[test]
    fn idempotent() {
        for s in &["./x/../foo/../../bar.h", "a//b/./c/..", "/foo/./bar"] {
            let once = CanonicalPath::new(s);
            let twice = CanonicalPath::new(once.as_str());
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn equality_and_hash_ignore_slash_bits() {
        use std::collections::HashSet;

        assert_eq!(CanonicalPath::new("./a/../b"), CanonicalPath::new("b"));

        let a = CanonicalPath {
            path: "x/y".to_string(),
            slash_bits: 0b1,
        };
        let b = CanonicalPath {
            path: "x/y".to_string(),
            slash_bits: 0,
        };
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains("x/y"));
        assert!(!set.insert(b));
    }

    #[test]
    fn decanonicalized_round_trip() {
        let (path, bits) = canon_win("a\\b\\c/d.h");
        let p = CanonicalPath {
            path,
            slash_bits: bits,
        };
        assert_eq!(p.decanonicalized(), "a\\b\\c/d.h");
    }
}
