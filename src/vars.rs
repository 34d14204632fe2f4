//! Helpers for the heterogeneous variable tree.
//!
//! Merged variable maps are plain `serde_yaml` mappings so the same value
//! tree is shared by the template engine, the registry and the YAML dump
//! output. Merging is deep for mappings and replace-on-conflict for
//! everything else, which gives the caller-controlled precedence the stack
//! relies on: later merges override earlier ones.

use serde_yaml::{Mapping, Value};

/// Deep-merge `src` into `dest`. Mappings merge recursively; any other
/// value in `src` replaces the value in `dest` wholesale.
pub fn merge_into(dest: &mut Mapping, src: &Mapping) {
    for (key, value) in src {
        match (dest.get_mut(key), value) {
            (Some(Value::Mapping(dest_child)), Value::Mapping(src_child)) => {
                merge_into(dest_child, src_child);
            }
            _ => {
                dest.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Deep-merge, consuming `src`
pub fn merged(mut dest: Mapping, src: &Mapping) -> Mapping {
    merge_into(&mut dest, src);
    dest
}

/// Build a nested mapping along `segments` with an empty string at the
/// leaf. Used to blank out suppressed keys in vars dumps.
pub fn blank_nested_map(segments: &[&str]) -> Mapping {
    let mut map = Mapping::new();
    match segments {
        [] => {}
        [leaf] => {
            map.insert(
                Value::String((*leaf).to_string()),
                Value::String(String::new()),
            );
        }
        [head, rest @ ..] => {
            map.insert(
                Value::String((*head).to_string()),
                Value::Mapping(blank_nested_map(rest)),
            );
        }
    }
    map
}

/// Render a scalar value the way it would appear in a shell environment
pub fn value_to_env_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}

/// Convenience constructor for string-keyed entries
pub fn entry(key: &str, value: Value) -> (Value, Value) {
    (Value::String(key.to_string()), value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(s: &str) -> Mapping {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn test_merge_overrides_scalars() {
        let mut dest = yaml("a: 1\nb: keep");
        merge_into(&mut dest, &yaml("a: 2"));
        assert_eq!(dest, yaml("a: 2\nb: keep"));
    }

    #[test]
    fn test_merge_is_deep_for_mappings() {
        let mut dest = yaml("outer:\n  x: 1\n  y: 2");
        merge_into(&mut dest, &yaml("outer:\n  y: 3\n  z: 4"));
        assert_eq!(dest, yaml("outer:\n  x: 1\n  y: 3\n  z: 4"));
    }

    #[test]
    fn test_merge_replaces_sequences() {
        let mut dest = yaml("list:\n- 1\n- 2");
        merge_into(&mut dest, &yaml("list:\n- 3"));
        assert_eq!(dest, yaml("list:\n- 3"));
    }

    #[test]
    fn test_merge_scalar_over_mapping() {
        let mut dest = yaml("key:\n  nested: 1");
        merge_into(&mut dest, &yaml("key: flat"));
        assert_eq!(dest, yaml("key: flat"));
    }

    #[test]
    fn test_blank_nested_map() {
        let blanked = blank_nested_map(&["provider", "region"]);
        assert_eq!(blanked, yaml("provider:\n  region: \"\""));
    }

    #[test]
    fn test_blank_single_segment() {
        let blanked = blank_nested_map(&["secret"]);
        assert_eq!(blanked, yaml("secret: \"\""));
    }

    #[test]
    fn test_value_to_env_string() {
        assert_eq!(value_to_env_string(&Value::Bool(true)), "true");
        assert_eq!(
            value_to_env_string(&Value::String("x".to_string())),
            "x"
        );
        assert_eq!(value_to_env_string(&Value::Null), "");
    }

    #[test]
    fn test_highest_precedence_wins_across_layers() {
        // precedence is caller-controlled: merging layers in order means the
        // last layer defining a key wins
        let layers = [
            yaml("region: eu-west-1\nprofile: dev"),
            yaml("region: us-east-1"),
            yaml("region: ap-south-1\nextra: true"),
        ];
        let mut result = Mapping::new();
        for layer in &layers {
            merge_into(&mut result, layer);
        }
        assert_eq!(result, yaml("region: ap-south-1\nprofile: dev\nextra: true"));
    }
}
