use serde_json::Value;

/// Recursively merge `overlay` into `base`. Objects merge key by key;
/// any other overlay value (including arrays) replaces the base value.
/// A null overlay leaves the base untouched.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (_, Value::Null) => {}
        (Value::Object(b), Value::Object(o)) => {
            for (k, v) in o {
                deep_merge(b.entry(k.clone()).or_insert(Value::Null), v);
            }
        }
        (b, o) => *b = o.clone(),
    }
}

/// Merge a sequence of layers left to right into a fresh object.
pub fn merged<'a>(layers: impl IntoIterator<Item = &'a Value>) -> Value {
    let mut out = Value::Object(Default::default());
    for layer in layers {
        deep_merge(&mut out, layer);
    }
    out
}
