//! Password authentication responses.

use md5::{Digest, Md5};

/// `"md5" + md5hex(md5hex(password + user) + salt)`
pub fn md5_password(user: &str, password: &str, salt: [u8; 4]) -> String {
    let mut inner = Md5::new();
    inner.update(password.as_bytes());
    inner.update(user.as_bytes());
    let inner_hex = hex::encode(inner.finalize());

    let mut outer = Md5::new();
    outer.update(inner_hex.as_bytes());
    outer.update(salt);
    format!("md5{}", hex::encode(outer.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md5_password_shape() {
        let a = md5_password("chat", "secret", [1, 2, 3, 4]);
        assert!(a.starts_with("md5"));
        assert_eq!(a.len(), 35);
        assert!(a[3..].chars().all(|c| c.is_ascii_hexdigit()));
        // Salt and user both feed the digest
        assert_ne!(a, md5_password("chat", "secret", [4, 3, 2, 1]));
        assert_ne!(a, md5_password("other", "secret", [1, 2, 3, 4]));
    }

    #[test]
    fn test_md5_inner_digest() {
        // md5("") is the well-known d41d8cd9... digest
        let mut h = Md5::new();
        h.update(b"");
        assert_eq!(hex::encode(h.finalize()), "d41d8cd98f00b204e9800998ecf8427e");
    }
}
