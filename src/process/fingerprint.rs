use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};

/// Deterministic identity of a launch configuration.
///
/// Argument order is significant; environment order is not. Every field is
/// length-prefixed so `["a b"]` and `["a", "b"]` hash differently.
pub fn fingerprint(command: &str, args: &[String], env: &HashMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    feed(&mut hasher, command.as_bytes());

    hasher.update((args.len() as u64).to_le_bytes());
    for arg in args {
        feed(&mut hasher, arg.as_bytes());
    }

    let sorted: BTreeMap<&str, &str> = env.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
    hasher.update((sorted.len() as u64).to_le_bytes());
    for (key, value) in sorted {
        feed(&mut hasher, key.as_bytes());
        feed(&mut hasher, value.as_bytes());
    }

    hex::encode(hasher.finalize())
}

fn feed(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}
