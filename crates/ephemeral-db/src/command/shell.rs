//! POSIX shell quoting for command lines handed to `su -c`.
//!
//! Quoting works on raw bytes. Single quotes pass every byte but `'`
//! through untouched, so paths that are not valid UTF-8 reach the shell
//! exactly as the kernel reported them.

use std::borrow::Cow;
use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};

/// Quotes `word` so a POSIX shell reads it back as a single argument.
///
/// Words made only of characters with no special meaning pass through
/// untouched. Anything else is wrapped in single quotes, with embedded
/// single quotes closed, escaped, and reopened. The empty word becomes `''`.
///
/// ```
/// use std::ffi::OsStr;
///
/// use ephemeral_db::command::shell::quote;
///
/// assert_eq!(quote(OsStr::new("--no-sync")), OsStr::new("--no-sync"));
/// assert_eq!(quote(OsStr::new("")), OsStr::new("''"));
/// assert_eq!(quote(OsStr::new("it's")), OsStr::new(r"'it'\''s'"));
/// ```
#[must_use]
pub fn quote(word: &OsStr) -> Cow<'_, OsStr> {
    let bytes = word.as_bytes();
    if bytes.is_empty() {
        return Cow::Borrowed(OsStr::new("''"));
    }
    if bytes.iter().copied().all(is_inert) {
        return Cow::Borrowed(word);
    }
    let mut quoted = Vec::with_capacity(bytes.len() + 2);
    quoted.push(b'\'');
    for &byte in bytes {
        if byte == b'\'' {
            quoted.extend_from_slice(br"'\''");
        } else {
            quoted.push(byte);
        }
    }
    quoted.push(b'\'');
    Cow::Owned(OsString::from_vec(quoted))
}

/// Joins words into a single shell command line, quoting each one.
#[must_use]
pub fn join<I, S>(words: I) -> OsString
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut line = OsString::new();
    for (index, word) in words.into_iter().enumerate() {
        if index > 0 {
            line.push(" ");
        }
        line.push(quote(word.as_ref()));
    }
    line
}

const fn is_inert(byte: u8) -> bool {
    byte.is_ascii_alphanumeric()
        || matches!(byte, b'-' | b'_' | b'.' | b'/' | b':' | b',' | b'+' | b'@' | b'%')
}
