use chrono::Utc;

pub fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
