//! Path normalization and containment checks on tracee-visible paths.
//!
//! Paths are handled as the tracee spelled them. Nothing here touches the host
//! filesystem, so symlinks are never resolved and `..` is purely lexical.

/// Normalize `path` in place.
///
/// A write cursor trails a read cursor that advances one `/`-delimited segment
/// at a time. Duplicate slashes and `.` segments are skipped; `..` pops the
/// last retained segment unless the cursor sits at the root or behind a
/// leading `..` of a relative path, which can never be ascended past.
pub fn abs_in_place(path: &mut String) {
    let mut buf = std::mem::take(path).into_bytes();
    let len = buf.len();
    let absolute = buf.first() == Some(&b'/');
    let base = usize::from(absolute);

    let mut w = base;
    let mut r = base;
    // Everything before `floor` is either the root slash or unresolvable `..`.
    let mut floor = base;

    while r < len {
        if buf[r] == b'/' {
            r += 1;
            continue;
        }

        let start = r;
        while r < len && buf[r] != b'/' {
            r += 1;
        }
        let segment = &buf[start..r];

        if segment == b"." {
            continue;
        }

        if segment == b".." {
            if w > floor {
                let mut p = w;
                while p > base && buf[p - 1] != b'/' {
                    p -= 1;
                }
                w = if p > base { p - 1 } else { p };
                continue;
            }
            if absolute {
                continue;
            }
        }

        if w > base {
            buf[w] = b'/';
            w += 1;
        }
        buf.copy_within(start..r, w);
        w += r - start;

        if &buf[w - (r - start)..w] == b".." {
            floor = w;
        }
    }

    buf.truncate(w);
    *path = match String::from_utf8(buf) {
        Ok(s) => s,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    };
}

/// Normalized copy of `path`.
pub fn abs(path: &str) -> String {
    let mut owned = path.to_string();
    abs_in_place(&mut owned);
    owned
}

/// Append a separator and `child` to `parent`.
pub fn join(parent: &str, child: &str) -> String {
    let mut joined = String::with_capacity(parent.len() + child.len() + 1);
    joined.push_str(parent);
    joined.push('/');
    joined.push_str(child);
    joined
}

/// Resolve `path` against `base` unless it is already absolute, then normalize.
pub fn resolve(base: &str, path: &str) -> String {
    if path.starts_with('/') {
        abs(path)
    } else {
        abs(&join(base, path))
    }
}

/// True iff `child` equals `parent` or lies below it.
///
/// `/a` contains `/a/b` but not `/ab`.
pub fn contains(parent: &str, child: &str) -> bool {
    if !child.starts_with(parent) {
        return false;
    }
    if child.len() == parent.len() {
        return true;
    }
    parent.ends_with('/') || child.as_bytes()[parent.len()] == b'/'
}
