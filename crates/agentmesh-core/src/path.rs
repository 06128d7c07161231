use serde_json::Value;

/// Walk `value` along dotted-path segments.
///
/// Object members are matched by key; arrays accept a decimal index.
/// Returns `None` as soon as a segment does not resolve.
pub fn lookup<'a, 'p>(
    value: &'a Value,
    segments: impl IntoIterator<Item = &'p str>,
) -> Option<&'a Value> {
    let mut current = value;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Split a dotted path, ignoring empty segments.
pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('.').map(str::trim).filter(|s| !s.is_empty())
}
