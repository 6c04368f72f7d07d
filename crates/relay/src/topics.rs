use once_cell::sync::Lazy;
use regex::Regex;

static STATUS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^user/([^/]+)/status$").unwrap());
static SIGNAL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^user/([^/]+)/signal$").unwrap());
static ROOM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^room/([^/]+)/events$").unwrap());

pub fn status_topic(id: &str) -> String {
    format!("user/{}/status", id)
}

pub fn signal_topic(id: &str) -> String {
    format!("user/{}/signal", id)
}

pub fn room_topic(room_id: &str) -> String {
    format!("room/{}/events", room_id)
}

pub fn split_status_topic(topic: &str) -> Option<String> {
    STATUS_RE.captures(topic).and_then(|caps| caps.get(1).map(|m| m.as_str().to_string()))
}

pub fn split_signal_topic(topic: &str) -> Option<String> {
    SIGNAL_RE.captures(topic).and_then(|caps| caps.get(1).map(|m| m.as_str().to_string()))
}

pub fn split_room_topic(topic: &str) -> Option<String> {
    ROOM_RE.captures(topic).and_then(|caps| caps.get(1).map(|m| m.as_str().to_string()))
}
