//! 正規化表現に対する MD5 コンテンツハッシュ。

use md5::{Digest, Md5};
use serde_json::Value;

/// 値の正規化テキスト表現を返す。
///
/// 文字列は引用符なしの生の内容、数値と真偽値はリテラル表記、
/// 配列とオブジェクトはキーを辞書順に並べたコンパクトな JSON になる。
pub fn canonical_form(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        _ => {
            let mut out = String::new();
            write_canonical_json(value, &mut out);
            out
        }
    }
}

// serde_json の preserve_order 機能の有無に依存しないよう、キーは明示的に整列する
fn write_canonical_json(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_unstable_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical_json(item, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical_json(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// 値の 128 ビットハッシュを小文字 16 進で返す。
pub fn generate_hash(value: &Value) -> String {
    let mut hasher = Md5::new();
    hasher.update(canonical_form(value).as_bytes());
    hex::encode(hasher.finalize())
}
