//! Content translation between working and normal form
//!
//! Files with `svn:eol-style` are stored and transmitted with LF line
//! endings. The working file uses whatever terminator the style asks for.

use dsvn_core::EolStyle;
use std::borrow::Cow;
use std::fs;
use std::io;
use std::path::Path;

/// Convert CRLF and lone CR line endings to LF
pub fn normalize_eol(data: &[u8]) -> Cow<'_, [u8]> {
    if !data.contains(&b'\r') {
        return Cow::Borrowed(data);
    }
    let mut out = Vec::with_capacity(data.len());
    let mut iter = data.iter().copied().peekable();
    while let Some(b) = iter.next() {
        if b == b'\r' {
            if iter.peek() == Some(&b'\n') {
                iter.next();
            }
            out.push(b'\n');
        } else {
            out.push(b);
        }
    }
    Cow::Owned(out)
}

/// Convert normal-form text into the working form for `eol`
pub fn to_working_form(data: &[u8], eol: Option<EolStyle>) -> Cow<'_, [u8]> {
    let Some(style) = eol else {
        return Cow::Borrowed(data);
    };
    let terminator = style.terminator();
    if terminator == b"\n" {
        return normalize_eol(data);
    }
    let normal = normalize_eol(data);
    let mut out = Vec::with_capacity(normal.len());
    for &b in normal.iter() {
        if b == b'\n' {
            out.extend_from_slice(terminator);
        } else {
            out.push(b);
        }
    }
    Cow::Owned(out)
}

/// Normal form of the bytes in a working file
pub fn to_normal_form(data: &[u8], eol: Option<EolStyle>) -> Cow<'_, [u8]> {
    match eol {
        Some(_) => normalize_eol(data),
        None => Cow::Borrowed(data),
    }
}

/// Read a working file and return its normal form
pub fn read_normal_form(path: &Path, eol: Option<EolStyle>) -> io::Result<Vec<u8>> {
    let data = fs::read(path)?;
    if eol.is_some() {
        if let Cow::Owned(normal) = normalize_eol(&data) {
            return Ok(normal);
        }
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_eol() {
        assert_eq!(normalize_eol(b"a\nb\n").as_ref(), b"a\nb\n");
        assert!(matches!(normalize_eol(b"plain"), Cow::Borrowed(_)));
        assert_eq!(normalize_eol(b"a\r\nb\rc\n").as_ref(), b"a\nb\nc\n");
        assert_eq!(normalize_eol(b"\r\r\n").as_ref(), b"\n\n");
    }

    #[test]
    fn test_working_form() {
        assert_eq!(to_working_form(b"a\nb\n", Some(EolStyle::CrLf)).as_ref(), b"a\r\nb\r\n");
        assert_eq!(to_working_form(b"a\r\nb", Some(EolStyle::Cr)).as_ref(), b"a\rb");
        assert_eq!(to_working_form(b"a\r\n", None).as_ref(), b"a\r\n");
        assert_eq!(to_normal_form(b"a\r\n", None).as_ref(), b"a\r\n");
        assert_eq!(to_normal_form(b"a\r\n", Some(EolStyle::Lf)).as_ref(), b"a\n");
    }

    #[test]
    fn test_read_normal_form() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("f.txt");
        fs::write(&path, b"x\r\ny\r\n").unwrap();
        assert_eq!(read_normal_form(&path, Some(EolStyle::Native)).unwrap(), b"x\ny\n");
        assert_eq!(read_normal_form(&path, None).unwrap(), b"x\r\ny\r\n");
    }
}
