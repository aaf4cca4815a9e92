//! MQTT topic parsing (C2): extract channel name and first-hop gateway id.
//!
//! Grounded in `original_source/src/mqtt_handler.py::_extract_channel_from_mqtt_topic`
//! and `_extract_gateway_node_id_from_topic`.

/// `channel_name` = the segment immediately after the literal `e`, provided
/// it does not itself look like a `!hex` node-id segment. Absence is not an
/// error — returns `None`.
pub fn channel_name(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    let e_idx = parts.iter().position(|p| *p == "e")?;
    let candidate = *parts.get(e_idx + 1)?;
    if candidate.starts_with('!') {
        None
    } else {
        Some(candidate)
    }
}

/// `gateway_node_id` = the first `!<hex>` segment, decoded as a 32-bit
/// unsigned integer. Absence or a malformed hex segment is not an error.
pub fn gateway_node_id(topic: &str) -> Option<u32> {
    topic.split('/').find_map(|part| {
        let hex = part.strip_prefix('!')?;
        u32::from_str_radix(hex, 16).ok()
    })
}
