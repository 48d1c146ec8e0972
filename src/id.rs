use chrono::Utc;

/// Prefixed identifier: `<prefix>_<unix millis>_<random u64>`
pub fn new_id(prefix: &str) -> String {
    let ts = Utc::now().timestamp_millis();
    let rand: u64 = rand::random();
    format!("{}_{}_{}", prefix, ts, rand)
}
