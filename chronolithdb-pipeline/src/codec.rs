//! Streaming JSON codec.
//!
//! Record format, newline-delimited. The first line is the meta record:
//!
//! ```json
//! {"T":"meta","A":["readings"],"label":"kitchen","readings":200}
//! ```
//!
//! `T` is the record type, `A` the list of array-field names; every other
//! entry is either a top-level scalar carried verbatim or an array field
//! carried as its integer length. Each further line is an item record
//! `{"T":"readings","D":<element>}` appending one element to one array
//! field, in file order.
//!
//! Field names that collide with the reserved tokens
//! `type, __arrays, data, meta, T, A, D, M` cannot sit in the meta record
//! directly; their entries are relocated under the `_u` escape sub-map and
//! restored transparently on decode.
//!
//! Readers must also accept a plain single-object JSON blob (the
//! save-and-quit fallback); [`decode_text`] sniffs the first non-empty
//! line to tell the two forms apart.

use serde_json::{json, Map, Value};

use chronolithdb_core::error::{Result, StoreError};

/// Names that would be ambiguous inside a meta record.
const RESERVED: [&str; 8] = ["type", "__arrays", "data", "meta", "T", "A", "D", "M"];

/// Flush threshold for the encoder's write buffer, in bytes.
const WRITE_BUFFER_THRESHOLD: usize = 512;

fn is_reserved(name: &str) -> bool {
    RESERVED.contains(&name)
}

fn codec_error(detail: impl Into<String>) -> StoreError {
    StoreError::Parse {
        path: String::new(),
        detail: detail.into(),
    }
}

#[derive(Debug, Clone, Copy)]
enum EncodePhase {
    Meta,
    Items { key_idx: usize, elem_idx: usize },
    Done,
}

/// Incremental encoder: splits the input into scalars and array fields,
/// emits the meta record, then streams item records in ~512-byte chunks so
/// the driving job can yield between writes.
#[derive(Debug)]
pub struct EncodeState {
    meta_line: String,
    arrays: Vec<(String, Vec<Value>)>,
    phase: EncodePhase,
}

impl EncodeState {
    pub fn new(object: &Map<String, Value>) -> Result<Self> {
        let mut arrays: Vec<(String, Vec<Value>)> = Vec::new();
        let mut meta = Map::new();
        let mut escape = Map::new();
        for (key, value) in object {
            match value {
                Value::Array(items) => arrays.push((key.clone(), items.clone())),
                scalar => {
                    if is_reserved(key) {
                        escape.insert(key.clone(), scalar.clone());
                    } else {
                        meta.insert(key.clone(), scalar.clone());
                    }
                }
            }
        }
        meta.insert("T".into(), json!("meta"));
        meta.insert(
            "A".into(),
            Value::Array(arrays.iter().map(|(name, _)| json!(name)).collect()),
        );
        for (name, items) in &arrays {
            let length = json!(items.len());
            if is_reserved(name) {
                escape.insert(name.clone(), length);
            } else {
                meta.insert(name.clone(), length);
            }
        }
        if !escape.is_empty() {
            meta.insert("_u".into(), Value::Object(escape));
        }
        let meta_line = serde_json::to_string(&Value::Object(meta))
            .map_err(|e| codec_error(e.to_string()))?;
        Ok(Self {
            meta_line,
            arrays,
            phase: EncodePhase::Meta,
        })
    }

    pub fn is_done(&self) -> bool {
        matches!(self.phase, EncodePhase::Done)
    }

    /// Produce the next buffered chunk of newline-terminated records, or
    /// `None` once everything has been emitted. A chunk is cut as soon as
    /// it crosses the write-buffer threshold.
    pub fn next_chunk(&mut self) -> Result<Option<String>> {
        let mut buffer = String::new();
        loop {
            match self.phase {
                EncodePhase::Meta => {
                    buffer.push_str(&self.meta_line);
                    buffer.push('\n');
                    self.phase = EncodePhase::Items {
                        key_idx: 0,
                        elem_idx: 0,
                    };
                }
                EncodePhase::Items { key_idx, elem_idx } => {
                    if key_idx >= self.arrays.len() {
                        self.phase = EncodePhase::Done;
                        continue;
                    }
                    let (name, items) = &self.arrays[key_idx];
                    if elem_idx >= items.len() {
                        self.phase = EncodePhase::Items {
                            key_idx: key_idx + 1,
                            elem_idx: 0,
                        };
                        continue;
                    }
                    let record = json!({"T": name, "D": items[elem_idx]});
                    let line = serde_json::to_string(&record)
                        .map_err(|e| codec_error(e.to_string()))?;
                    buffer.push_str(&line);
                    buffer.push('\n');
                    self.phase = EncodePhase::Items {
                        key_idx,
                        elem_idx: elem_idx + 1,
                    };
                    if buffer.len() >= WRITE_BUFFER_THRESHOLD {
                        return Ok(Some(buffer));
                    }
                }
                EncodePhase::Done => {
                    return Ok(if buffer.is_empty() { None } else { Some(buffer) });
                }
            }
        }
    }

    /// Drain the whole encoding at once. Test and fallback convenience;
    /// the pipeline itself streams chunk by chunk.
    pub fn into_string(mut self) -> Result<String> {
        let mut out = String::new();
        while let Some(chunk) = self.next_chunk()? {
            out.push_str(&chunk);
        }
        Ok(out)
    }
}

/// Incremental decoder for the line-delimited form. Feed records one line
/// at a time (the driving job yields every few records), then take the
/// reassembled logical object with [`DecodeState::finish`].
#[derive(Debug, Default)]
pub struct DecodeState {
    started: bool,
    scalars: Map<String, Value>,
    arrays: Vec<(String, Vec<Value>)>,
}

impl DecodeState {
    pub fn new() -> Self {
        Self::default()
    }

    fn array_mut(&mut self, name: &str) -> Option<&mut Vec<Value>> {
        self.arrays
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, items)| items)
    }

    fn accept_meta(&mut self, mut meta: Map<String, Value>) -> Result<()> {
        meta.remove("T");
        let declared = match meta.remove("A") {
            Some(Value::Array(names)) => names,
            Some(other) => {
                return Err(codec_error(format!("meta record `A` must be a list, got {other}")))
            }
            None => Vec::new(),
        };
        for name in declared {
            let Value::String(name) = name else {
                return Err(codec_error("array-field names must be strings"));
            };
            self.arrays.push((name, Vec::new()));
        }
        let escape = match meta.remove("_u") {
            Some(Value::Object(escape)) => escape,
            Some(other) => {
                return Err(codec_error(format!("`_u` escape must be a map, got {other}")))
            }
            None => Map::new(),
        };
        for (key, value) in meta.into_iter().chain(escape) {
            // Array entries in the meta record only carry lengths; the
            // items themselves arrive as item records.
            if self.array_mut(&key).is_none() {
                self.scalars.insert(key, value);
            }
        }
        self.started = true;
        Ok(())
    }

    pub fn feed_line(&mut self, line: &str) -> Result<()> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(());
        }
        let record: Value =
            serde_json::from_str(line).map_err(|e| codec_error(e.to_string()))?;
        let Value::Object(mut record) = record else {
            return Err(codec_error(format!("record is not an object: {line}")));
        };
        if !self.started {
            if record.get("T") != Some(&json!("meta")) {
                return Err(codec_error("first record must be the meta record"));
            }
            return self.accept_meta(record);
        }
        let Some(Value::String(field)) = record.remove("T") else {
            return Err(codec_error(format!("item record without `T`: {line}")));
        };
        let data = record
            .remove("D")
            .ok_or_else(|| codec_error(format!("item record without `D`: {line}")))?;
        match self.array_mut(&field) {
            Some(items) => {
                items.push(data);
                Ok(())
            }
            None => Err(codec_error(format!("item record for undeclared array `{field}`"))),
        }
    }

    pub fn finish(self) -> Result<Value> {
        if !self.started {
            return Err(codec_error("no meta record seen"));
        }
        let mut object = self.scalars;
        for (name, items) in self.arrays {
            object.insert(name, Value::Array(items));
        }
        Ok(Value::Object(object))
    }
}

/// Decode either wire form from a full text: peek at the first non-empty
/// line; if it is a meta record, run the line decoder, otherwise fall back
/// to parsing the text as one legacy JSON object.
pub fn decode_text(text: &str) -> Result<Value> {
    let first = text.lines().find(|line| !line.trim().is_empty());
    let Some(first) = first else {
        return Err(codec_error("empty input"));
    };
    let streaming = serde_json::from_str::<Value>(first.trim())
        .ok()
        .and_then(|v| v.get("T").cloned())
        .map(|t| t == json!("meta"))
        .unwrap_or(false);
    if streaming {
        let mut state = DecodeState::new();
        for line in text.lines() {
            state.feed_line(line)?;
        }
        state.finish()
    } else {
        serde_json::from_str(text).map_err(|e| codec_error(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    fn encode(value: &Value) -> String {
        EncodeState::new(&object(value.clone())).unwrap().into_string().unwrap()
    }

    #[test]
    fn meta_record_carries_scalars_and_array_lengths() {
        let input = json!({
            "label": "kitchen",
            "readings": [1, 2, 3],
        });
        let text = encode(&input);
        let meta: Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(meta["T"], json!("meta"));
        assert_eq!(meta["A"], json!(["readings"]));
        assert_eq!(meta["label"], json!("kitchen"));
        assert_eq!(meta["readings"], json!(3));
        assert_eq!(text.lines().count(), 4);
    }

    #[test]
    fn item_records_follow_in_file_order() {
        let input = json!({"xs": [10, 20]});
        let text = encode(&input);
        let lines: Vec<&str> = text.lines().collect();
        let first: Value = serde_json::from_str(lines[1]).unwrap();
        let second: Value = serde_json::from_str(lines[2]).unwrap();
        assert_eq!(first, json!({"T": "xs", "D": 10}));
        assert_eq!(second, json!({"T": "xs", "D": 20}));
    }

    #[test]
    fn round_trips_scalars_and_arrays() {
        let input = json!({
            "name": "sensor-7",
            "enabled": true,
            "weight": 2.5,
            "tags": ["a", "b"],
            "samples": [1, 2, 3, 4],
        });
        assert_eq!(decode_text(&encode(&input)).unwrap(), input);
    }

    #[test]
    fn reserved_names_round_trip_through_the_escape_map() {
        let input = json!({
            "type": "profile",
            "meta": 7,
            "data": [1, 2, 3],
        });
        let text = encode(&input);
        let meta: Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        // The colliding entries moved under `_u`; `T`/`A` stay unambiguous.
        assert_eq!(meta["T"], json!("meta"));
        assert_eq!(meta["_u"]["type"], json!("profile"));
        assert_eq!(meta["_u"]["meta"], json!(7));
        assert_eq!(meta["_u"]["data"], json!(3));
        assert_eq!(decode_text(&text).unwrap(), input);
    }

    #[test]
    fn legacy_single_blob_is_accepted() {
        let legacy = r#"{"name": "fallback", "xs": [1, 2]}"#;
        assert_eq!(
            decode_text(legacy).unwrap(),
            json!({"name": "fallback", "xs": [1, 2]})
        );
        // Pretty-printed legacy blobs sniff as legacy too.
        let pretty = "{\n  \"name\": \"fallback\"\n}";
        assert_eq!(decode_text(pretty).unwrap(), json!({"name": "fallback"}));
    }

    #[test]
    fn chunking_respects_the_buffer_threshold() {
        let samples: Vec<Value> = (0..200).map(|i| json!(i)).collect();
        let input = json!({"samples": samples});
        let mut state = EncodeState::new(&object(input.clone())).unwrap();
        let mut chunks = Vec::new();
        while let Some(chunk) = state.next_chunk().unwrap() {
            chunks.push(chunk);
        }
        assert!(chunks.len() > 1, "200 items must not fit one chunk");
        for chunk in &chunks[..chunks.len() - 1] {
            assert!(chunk.len() >= WRITE_BUFFER_THRESHOLD);
        }
        let text: String = chunks.concat();
        assert_eq!(decode_text(&text).unwrap(), input);
    }

    #[test]
    fn empty_arrays_and_scalar_only_objects() {
        let empty_array = json!({"xs": []});
        assert_eq!(decode_text(&encode(&empty_array)).unwrap(), empty_array);

        let scalar_only = json!({"a": 1, "b": "two"});
        let text = encode(&scalar_only);
        assert_eq!(text.lines().count(), 1);
        assert_eq!(decode_text(&text).unwrap(), scalar_only);
    }

    #[test]
    fn item_record_for_undeclared_array_is_rejected() {
        let mut state = DecodeState::new();
        state.feed_line(r#"{"T":"meta","A":["xs"],"xs":1}"#).unwrap();
        assert!(state.feed_line(r#"{"T":"ys","D":1}"#).is_err());
    }

    proptest! {
        #[test]
        fn round_trip_law(
            scalars in proptest::collection::btree_map(
                "[a-z]{1,8}",
                proptest::arbitrary::any::<i64>(),
                0..4,
            ),
            arrays in proptest::collection::btree_map(
                "[a-z]{1,8}",
                proptest::collection::vec(proptest::arbitrary::any::<i64>(), 0..20),
                0..3,
            ),
        ) {
            let mut map = Map::new();
            for (k, v) in &scalars {
                map.insert(k.clone(), json!(v));
            }
            for (k, vs) in &arrays {
                // An array and a scalar sharing a name is not a valid
                // logical object; the array wins, as it would in JSON.
                map.insert(k.clone(), json!(vs));
            }
            let input = Value::Object(map);
            let text = EncodeState::new(&object(input.clone())).unwrap().into_string().unwrap();
            prop_assert_eq!(decode_text(&text).unwrap(), input);
        }
    }
}
