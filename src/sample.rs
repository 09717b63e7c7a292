use rand::Rng;
use serde_json::{json, Map, Value};

const ALL_TAGS: [&str; 8] = [
    "fast", "reliable", "secure", "scalable",
    "resilient", "portable", "robust", "maintainable",
];

/// Generate `count` records with varied content, missing fields and nested
/// measurements (experiment → trial → sensor → reading).
pub fn synthetic_collection<R: Rng + ?Sized>(rng: &mut R, count: usize) -> Vec<Value> {
    (0..count).map(|i| synthetic_record(rng, i)).collect()
}

fn synthetic_record<R: Rng + ?Sized>(rng: &mut R, i: usize) -> Value {
    let mut record = Map::new();

    // IDs
    if rng.random_bool(0.7) {
        record.insert("id".into(), json!([1000 + i, 2000 + i]));
    } else {
        record.insert("id".into(), json!(1000 + i));
    }

    if rng.random_bool(0.9) {
        record.insert("name".into(), json!(format!("Alpha{i}")));
    }

    if rng.random_bool(0.85) {
        record.insert("value".into(), json!(40.0 + i as f64 * 0.1));
    }

    if rng.random_bool(0.8) {
        let category = match i % 3 {
            0 => "science",
            1 => "engineering",
            _ => "mathematics",
        };
        record.insert("category".into(), json!(category));
    }

    // Random 0–5 tags
    let tag_count = rng.random_range(0..=5);
    if tag_count > 0 {
        let tags: Vec<&str> = (0..tag_count)
            .map(|_| ALL_TAGS[rng.random_range(0..ALL_TAGS.len())])
            .collect();
        record.insert("tags".into(), json!(tags));
    }

    if rng.random_bool(0.7) {
        let experiments: Vec<Value> = (0..rng.random_range(1..=3))
            .map(|_| {
                let trials: Vec<Value> = (0..rng.random_range(1..=3))
                    .map(|_| {
                        let sensors: Vec<Value> = (0..rng.random_range(1..=2))
                            .map(|_| {
                                let readings: Vec<f64> = (0..rng.random_range(1..=4))
                                    .map(|_| (rng.random_range(10.0..100.0_f64) * 100.0).round() / 100.0)
                                    .collect();
                                json!({ "reading": readings })
                            })
                            .collect();
                        json!({ "sensor": sensors })
                    })
                    .collect();
                json!({ "trial": trials })
            })
            .collect();
        record.insert("measurements".into(), json!({ "experiment": experiments }));
    }

    // Meta
    let mut meta = Map::new();
    if rng.random_bool(0.9) {
        meta.insert("created".into(), json!("2025-10-23"));
    }
    if rng.random_bool(0.8) {
        meta.insert("updated".into(), json!("2025-10-24"));
    }
    if !meta.is_empty() {
        record.insert("meta".into(), Value::Object(meta));
    }

    Value::Object(record)
}

/// `count` flat objects with exactly `fields` scalar leaves each.
pub fn flat_documents(count: usize, fields: usize) -> Vec<Value> {
    (0..count)
        .map(|i| {
            let record: Map<String, Value> = (0..fields)
                .map(|f| (format!("f{f}"), json!(i * fields + f)))
                .collect();
            Value::Object(record)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flattener::leaf_count;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_seeded_generation_is_reproducible() {
        let a = synthetic_collection(&mut StdRng::seed_from_u64(3), 50);
        let b = synthetic_collection(&mut StdRng::seed_from_u64(3), 50);
        assert_eq!(a, b);
        assert!(a.iter().all(|r| r.get("id").is_some()));
    }

    #[test]
    fn test_flat_documents_shape() {
        let docs = flat_documents(4, 5);
        assert_eq!(docs.len(), 4);
        assert!(docs.iter().all(|d| leaf_count(d) == 5));
        assert_eq!(docs[1]["f0"], json!(5));
    }
}
