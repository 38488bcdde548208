use dts_types::Task;
use serde_json::Value;

/// Fields appended by signing; they never take part in the signed bytes.
pub const SIGNATURE_FIELDS: [&str; 2] = ["signature", "sender_public_key"];

/// Deterministic encoding of a task for signing: compact JSON with object
/// keys sorted at every level and the signature fields removed.
pub fn canonical_task_bytes(task: &Task) -> Result<Vec<u8>, serde_json::Error> {
    let mut value = serde_json::to_value(task)?;
    if let Value::Object(map) = &mut value {
        for field in SIGNATURE_FIELDS {
            map.remove(field);
        }
    }

    let mut out = Vec::with_capacity(256);
    write_canonical(&value, &mut out)?;
    Ok(out)
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) -> Result<(), serde_json::Error> {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push(b'{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                serde_json::to_writer(&mut *out, key)?;
                out.push(b':');
                write_canonical(&map[key.as_str()], out)?;
            }
            out.push(b'}');
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out)?;
            }
            out.push(b']');
        }
        scalar => serde_json::to_writer(&mut *out, scalar)?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    #[test]
    fn test_keys_sorted_and_signature_removed() {
        let mut kwargs = Map::new();
        kwargs.insert("zeta".into(), json!({"b": 1, "a": [2, {"d": 0, "c": 1}]}));
        kwargs.insert("alpha".into(), json!(true));

        let mut task = Task::new("f", vec![json!(1)], kwargs, "node-a");
        task.task_id = "f_1.000000".into();
        task.signature = Some("sig".into());
        task.sender_public_key = Some("pem".into());

        let bytes = canonical_task_bytes(&task).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(
            text,
            r#"{"args":[1],"func":"f","kwargs":{"alpha":true,"zeta":{"a":[2,{"c":1,"d":0}],"b":1}},"sender_id":"node-a","task_id":"f_1.000000"}"#
        );
    }

    #[test]
    fn test_signature_fields_do_not_change_bytes() {
        let task = Task::new("f", vec![], Map::new(), "node-a");
        let mut signed = task.clone();
        signed.signature = Some("abc".into());
        assert_eq!(canonical_task_bytes(&task).unwrap(), canonical_task_bytes(&signed).unwrap());
    }
}
