//! Dotted/indexed path lookup into JSON values.
//!
//! Supported forms: `""` and `"."` select the whole value, `user.name`
//! walks object keys, `items.0` and `items[0]` index arrays, and the two can
//! be combined (`orders[1].lines[0].sku`).

use serde_json::Value;

/// One accessor in a parsed path.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment<'a> {
    Key(&'a str),
    Index(usize),
}

/// Resolve `path` inside `value`. Returns `None` on any miss.
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.trim();
    if path.is_empty() || path == "." {
        return Some(value);
    }

    let mut current = value;
    for segment in parse(path)? {
        current = match (segment, current) {
            (Segment::Index(index), Value::Array(items)) => items.get(index)?,
            // Numeric segments may also name object keys ("0": ...).
            (Segment::Index(index), Value::Object(map)) => map.get(&index.to_string())?,
            (Segment::Key(key), Value::Object(map)) => map.get(key)?,
            _ => return None,
        };
    }
    Some(current)
}

fn parse(path: &str) -> Option<Vec<Segment<'_>>> {
    let mut segments = Vec::new();
    for part in path.split('.') {
        if part.is_empty() {
            continue;
        }
        let (head, mut rest) = match part.find('[') {
            Some(pos) => part.split_at(pos),
            None => (part, ""),
        };
        if !head.is_empty() {
            segments.push(match head.parse::<usize>() {
                Ok(index) => Segment::Index(index),
                Err(_) => Segment::Key(head),
            });
        }
        while !rest.is_empty() {
            let inner = rest.strip_prefix('[')?;
            let close = inner.find(']')?;
            segments.push(Segment::Index(inner[..close].trim().parse().ok()?));
            rest = &inner[close + 1..];
        }
    }
    Some(segments)
}
