//! GNU `filevercmp` ordering.
//!
//! Orders strings the way `ls -v` and `sort -V` do: embedded digit runs
//! compare numerically, `~` sorts before everything, and one trailing
//! file suffix (`.x`, `.~1~`, ...) is ignored unless the stems are equal.
//! The kernel selector relies on this so that `vmlinuz-5.12.0` outranks
//! `vmlinuz-5.9.0`.

use std::cmp::Ordering;
use std::ffi::OsString;
use std::os::unix::ffi::OsStrExt;

/// Compares two filenames by version.
pub fn filevercmp(a: &[u8], b: &[u8]) -> Ordering {
    if a == b {
        return Ordering::Equal;
    }

    // "" sorts first, then "." and "..".
    for special in [&b""[..], &b"."[..], &b".."[..]] {
        match (a == special, b == special) {
            (true, _) => return Ordering::Less,
            (_, true) => return Ordering::Greater,
            _ => {}
        }
    }

    // Hidden files group before everything else.
    let (a, b) = match (a.first() == Some(&b'.'), b.first() == Some(&b'.')) {
        (true, false) => return Ordering::Less,
        (false, true) => return Ordering::Greater,
        (true, true) => (&a[1..], &b[1..]),
        (false, false) => (a, b),
    };

    let mut a_len = suffix_start(a);
    let mut b_len = suffix_start(b);

    // If the stems are identical, compare the full strings instead so the
    // suffixes still participate.
    if (a_len < a.len() || b_len < b.len()) && a_len == b_len && a[..a_len] == b[..b_len] {
        a_len = a.len();
        b_len = b.len();
    }

    match verrevcmp(&a[..a_len], &b[..b_len]) {
        Ordering::Equal => a.cmp(b),
        ord => ord,
    }
}

/// Sorts names so the highest version comes first.
pub fn sort_reverse_version(names: &mut [OsString]) {
    names.sort_unstable_by(|a, b| filevercmp(b.as_bytes(), a.as_bytes()));
}

/// Index where the trailing file suffix begins: the earliest match of
/// `(\.[A-Za-z~][A-Za-z0-9~]*)*$`, or `s.len()` if there is none.
fn suffix_start(s: &[u8]) -> usize {
    let mut start: Option<usize> = None;
    let mut read_alpha = false;
    for (i, &c) in s.iter().enumerate() {
        if read_alpha {
            // First character after '.': must be a letter or '~'.
            read_alpha = false;
            if !c.is_ascii_alphabetic() && c != b'~' {
                start = None;
            }
        } else if c == b'.' {
            read_alpha = true;
            if start.is_none() {
                start = Some(i);
            }
        } else if !c.is_ascii_alphanumeric() && c != b'~' {
            start = None;
        }
    }
    start.unwrap_or(s.len())
}

/// Character weight outside digit runs: `~` before end-of-string, letters
/// in order, everything else after the letters.
fn order(c: u8) -> i32 {
    if c.is_ascii_digit() {
        0
    } else if c.is_ascii_alphabetic() {
        i32::from(c)
    } else if c == b'~' {
        -1
    } else {
        i32::from(c) + 256
    }
}

/// The Debian-style version comparison over two (suffix-stripped) names.
fn verrevcmp(a: &[u8], b: &[u8]) -> Ordering {
    let (mut ai, mut bi) = (0, 0);
    while ai < a.len() || bi < b.len() {
        let mut first_diff = 0i32;

        // Non-digit stretch: compare by character weight.
        while (ai < a.len() && !a[ai].is_ascii_digit()) || (bi < b.len() && !b[bi].is_ascii_digit())
        {
            let ac = if ai == a.len() { 0 } else { order(a[ai]) };
            let bc = if bi == b.len() { 0 } else { order(b[bi]) };
            if ac != bc {
                return ac.cmp(&bc);
            }
            ai += 1;
            bi += 1;
        }

        // Digit run: skip leading zeros, then compare digit-by-digit; a
        // longer run always wins.
        while ai < a.len() && a[ai] == b'0' {
            ai += 1;
        }
        while bi < b.len() && b[bi] == b'0' {
            bi += 1;
        }
        while ai < a.len() && bi < b.len() && a[ai].is_ascii_digit() && b[bi].is_ascii_digit() {
            if first_diff == 0 {
                first_diff = i32::from(a[ai]) - i32::from(b[bi]);
            }
            ai += 1;
            bi += 1;
        }
        if ai < a.len() && a[ai].is_ascii_digit() {
            return Ordering::Greater;
        }
        if bi < b.len() && b[bi].is_ascii_digit() {
            return Ordering::Less;
        }
        if first_diff != 0 {
            return first_diff.cmp(&0);
        }
    }
    Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_runs_compare_numerically() {
        assert_eq!(
            filevercmp(b"vmlinuz-5.12.0", b"vmlinuz-5.9.0"),
            Ordering::Greater
        );
        assert_eq!(
            filevercmp(b"vmlinuz-4.18.0", b"vmlinuz-5.14.0"),
            Ordering::Less
        );
        assert_eq!(filevercmp(b"a10", b"a9"), Ordering::Greater);
        // Equal numeric value: plain byte order breaks the tie.
        assert_eq!(filevercmp(b"a010", b"a10"), Ordering::Less);
    }

    #[test]
    fn specials_and_hidden() {
        assert_eq!(filevercmp(b"", b"a"), Ordering::Less);
        assert_eq!(filevercmp(b".", b".."), Ordering::Less);
        assert_eq!(filevercmp(b".hidden", b"visible"), Ordering::Less);
        assert_eq!(filevercmp(b"same", b"same"), Ordering::Equal);
    }

    #[test]
    fn tilde_sorts_first() {
        assert_eq!(filevercmp(b"a~", b"a"), Ordering::Less);
        assert_eq!(filevercmp(b"a~1", b"a1"), Ordering::Less);
    }

    #[test]
    fn reverse_sort_picks_newest_first() {
        let mut names: Vec<OsString> = [
            "vmlinuz-4.18.0.x86_64",
            "vmlinuz-5.14.0.x86_64",
            "vmlinuz-5.9.0.x86_64",
        ]
        .iter()
        .map(OsString::from)
        .collect();
        sort_reverse_version(&mut names);
        assert_eq!(names[0], OsString::from("vmlinuz-5.14.0.x86_64"));
        assert_eq!(names[2], OsString::from("vmlinuz-4.18.0.x86_64"));
    }
}
