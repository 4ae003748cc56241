//! WBI query signing.
//!
//! The signing key is derived by remixing the `img_key + sub_key` pair
//! published by the `nav` endpoint through a fixed permutation table. A signed
//! query is the sorted, escaped parameter list plus `w_rid`, the MD5 of that
//! list concatenated with the key.

use std::collections::BTreeMap;

use md5::{Digest, Md5};
use url::form_urlencoded::byte_serialize;

const MIXIN_KEY_TABLE: [usize; 64] = [
    46, 47, 18, 2, 53, 8, 23, 32, 15, 50, 10, 31, 58, 3, 45, 35, 27, 43, 5, 49, 33, 9, 42, 19, 29,
    28, 14, 39, 12, 38, 41, 13, 37, 48, 7, 16, 24, 55, 40, 61, 26, 17, 0, 1, 60, 51, 30, 4, 22, 25,
    54, 21, 56, 59, 6, 63, 57, 62, 11, 36, 20, 34, 44, 52,
];

const MIXIN_KEY_LEN: usize = 32;

/// Key name from a WBI image URL: the file name without its extension.
pub fn key_from_url(url: &str) -> &str {
    let file = url.rsplit('/').next().unwrap_or(url);
    file.rsplit_once('.').map_or(file, |(stem, _)| stem)
}

pub fn mixin_key(img_key: &str, sub_key: &str) -> String {
    let raw = format!("{img_key}{sub_key}");
    let raw = raw.as_bytes();
    MIXIN_KEY_TABLE
        .iter()
        .filter_map(|&i| raw.get(i).copied().map(char::from))
        .take(MIXIN_KEY_LEN)
        .collect()
}

/// Sign `params` with `wts` (unix seconds) and return the full query string,
/// `w_rid` last.
pub fn sign(params: &BTreeMap<String, String>, mixin_key: &str, wts: i64) -> String {
    let mut params = params.clone();
    params.insert("wts".to_string(), wts.to_string());

    let query = params
        .iter()
        .map(|(k, v)| format!("{}={}", escape(k), escape(&sanitize(v))))
        .collect::<Vec<_>>()
        .join("&");

    let mut hasher = Md5::new();
    hasher.update(query.as_bytes());
    hasher.update(mixin_key.as_bytes());
    let w_rid = format!("{:x}", hasher.finalize());

    format!("{query}&w_rid={w_rid}")
}

fn escape(s: &str) -> String {
    byte_serialize(s.as_bytes()).collect()
}

/// WBI rejects these characters in signed values.
fn sanitize(value: &str) -> String {
    value
        .chars()
        .filter(|c| !matches!(c, '!' | '\'' | '(' | ')' | '*'))
        .collect()
}
