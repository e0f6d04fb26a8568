//! NR-020: Native package version ordering.
//!
//! `rpmvercmp` for RPM and the dpkg `verrevcmp` algorithm for Debian.
//! Lexical string order is wrong for both (`1.10` > `1.9`, `1.0~rc1` < `1.0`).

use crate::core::state::PackageState;
use std::cmp::Ordering;

/// Compare two RPM version (or release) strings the way rpm does.
pub fn rpmvercmp(a: &str, b: &str) -> Ordering {
    if a == b {
        return Ordering::Equal;
    }
    let mut one = a.as_bytes();
    let mut two = b.as_bytes();

    loop {
        one = trim_separators(one);
        two = trim_separators(two);

        // Tilde sorts before everything, even the end of the string.
        match (one.first() == Some(&b'~'), two.first() == Some(&b'~')) {
            (true, true) => {
                one = &one[1..];
                two = &two[1..];
                continue;
            }
            (true, false) => return Ordering::Less,
            (false, true) => return Ordering::Greater,
            (false, false) => {}
        }

        // Caret sorts after the end of the string but before anything else.
        match (one.first() == Some(&b'^'), two.first() == Some(&b'^')) {
            (true, true) => {
                one = &one[1..];
                two = &two[1..];
                continue;
            }
            (true, false) => {
                return if two.is_empty() {
                    Ordering::Greater
                } else {
                    Ordering::Less
                };
            }
            (false, true) => {
                return if one.is_empty() {
                    Ordering::Less
                } else {
                    Ordering::Greater
                };
            }
            (false, false) => {}
        }

        if one.is_empty() || two.is_empty() {
            break;
        }

        let numeric = one[0].is_ascii_digit();
        let (seg1, rest1) = split_segment(one, numeric);
        let (seg2, rest2) = split_segment(two, numeric);
        one = rest1;
        two = rest2;

        // Segment types differ: numeric is newer than alpha.
        if seg2.is_empty() {
            return if numeric {
                Ordering::Greater
            } else {
                Ordering::Less
            };
        }

        let ord = if numeric {
            compare_numeric(seg1, seg2)
        } else {
            seg1.cmp(seg2)
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }

    match (one.is_empty(), two.is_empty()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        _ => Ordering::Greater,
    }
}

fn trim_separators(s: &[u8]) -> &[u8] {
    let skip = s
        .iter()
        .take_while(|c| !c.is_ascii_alphanumeric() && **c != b'~' && **c != b'^')
        .count();
    &s[skip..]
}

fn split_segment(s: &[u8], numeric: bool) -> (&[u8], &[u8]) {
    let len = s
        .iter()
        .take_while(|c| {
            if numeric {
                c.is_ascii_digit()
            } else {
                c.is_ascii_alphabetic()
            }
        })
        .count();
    s.split_at(len)
}

fn compare_numeric(a: &[u8], b: &[u8]) -> Ordering {
    let a = strip_zeros(a);
    let b = strip_zeros(b);
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

fn strip_zeros(s: &[u8]) -> &[u8] {
    let skip = s.iter().take_while(|c| **c == b'0').count();
    &s[skip..]
}

/// Compare two installed-or-desired RPM labels by version, then release.
/// Releases only participate when both sides carry one.
pub fn compare_rpm(a: &PackageState, b: &PackageState) -> Ordering {
    let ord = rpmvercmp(
        a.version.as_deref().unwrap_or(""),
        b.version.as_deref().unwrap_or(""),
    );
    if ord != Ordering::Equal {
        return ord;
    }
    match (&a.release, &b.release) {
        (Some(ra), Some(rb)) => rpmvercmp(ra, rb),
        _ => Ordering::Equal,
    }
}

/// dpkg's `verrevcmp` for one upstream-version or revision component.
pub fn deb_verrevcmp(a: &str, b: &str) -> Ordering {
    let mut one = a.as_bytes();
    let mut two = b.as_bytes();

    while !one.is_empty() || !two.is_empty() {
        while one.first().is_some_and(|c| !c.is_ascii_digit())
            || two.first().is_some_and(|c| !c.is_ascii_digit())
        {
            let ac = deb_order(one.first().copied());
            let bc = deb_order(two.first().copied());
            if ac != bc {
                return ac.cmp(&bc);
            }
            one = one.get(1..).unwrap_or_default();
            two = two.get(1..).unwrap_or_default();
        }

        one = strip_zeros(one);
        two = strip_zeros(two);

        let mut first_diff = Ordering::Equal;
        while one.first().is_some_and(u8::is_ascii_digit)
            && two.first().is_some_and(u8::is_ascii_digit)
        {
            if first_diff == Ordering::Equal {
                first_diff = one[0].cmp(&two[0]);
            }
            one = &one[1..];
            two = &two[1..];
        }
        if one.first().is_some_and(u8::is_ascii_digit) {
            return Ordering::Greater;
        }
        if two.first().is_some_and(u8::is_ascii_digit) {
            return Ordering::Less;
        }
        if first_diff != Ordering::Equal {
            return first_diff;
        }
    }
    Ordering::Equal
}

fn deb_order(c: Option<u8>) -> i32 {
    match c {
        None => 0,
        Some(c) if c.is_ascii_digit() => 0,
        Some(c) if c.is_ascii_alphabetic() => i32::from(c),
        Some(b'~') => -1,
        Some(c) => i32::from(c) + 256,
    }
}

/// Split `[epoch:]upstream` into a numeric epoch and the upstream part.
fn split_epoch(v: &str) -> (u64, &str) {
    match v.split_once(':') {
        Some((epoch, rest)) => (epoch.parse().unwrap_or(0), rest),
        None => (0, v),
    }
}

/// Compare `[epoch:]upstream` strings (no revision).
pub fn deb_version_cmp(a: &str, b: &str) -> Ordering {
    let (ea, ua) = split_epoch(a);
    let (eb, ub) = split_epoch(b);
    ea.cmp(&eb).then_with(|| deb_verrevcmp(ua, ub))
}

/// Compare Debian labels by epoch/upstream version, then revision.
/// Revisions only participate when both sides carry one.
pub fn compare_deb(a: &PackageState, b: &PackageState) -> Ordering {
    let ord = deb_version_cmp(
        a.version.as_deref().unwrap_or(""),
        b.version.as_deref().unwrap_or(""),
    );
    if ord != Ordering::Equal {
        return ord;
    }
    match (&a.release, &b.release) {
        (Some(ra), Some(rb)) => deb_verrevcmp(ra, rb),
        _ => Ordering::Equal,
    }
}

/// Split a full Debian version into `([epoch:]upstream, revision)`.
pub fn split_deb_version(full: &str) -> (String, Option<String>) {
    match full.rsplit_once('-') {
        Some((upstream, revision)) => (upstream.to_string(), Some(revision.to_string())),
        None => (full.to_string(), None),
    }
}
