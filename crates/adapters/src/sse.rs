//! Minimal SSE parsing for the HTTP-backed adapter.
//!
//! Events are delimited by `\n\n`; only `data:` lines matter here. The buffer
//! is drained in place, leaving any trailing partial event for the next call.

pub(crate) fn drain_data_lines(buffer: &mut String) -> Vec<String> {
    let mut data_lines = Vec::new();

    while let Some(pos) = buffer.find("\n\n") {
        let block: String = buffer.drain(..pos).collect();
        buffer.drain(..2); // the \n\n delimiter

        for line in block.lines() {
            let line = line.trim();
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim();
                if !data.is_empty() {
                    data_lines.push(data.to_string());
                }
            }
        }
    }

    data_lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_complete_events_keeps_partial() {
        let mut buffer =
            "data: {\"a\":1}\n\nevent: tick\ndata: {\"b\":2}\n\ndata: {\"partial\"".to_string();
        let lines = drain_data_lines(&mut buffer);
        assert_eq!(lines, vec![r#"{"a":1}"#, r#"{"b":2}"#]);
        assert_eq!(buffer, "data: {\"partial\"");
    }

    #[test]
    fn ignores_non_data_lines() {
        let mut buffer = "id: 7\nretry: 100\n\n".to_string();
        assert!(drain_data_lines(&mut buffer).is_empty());
        assert!(buffer.is_empty());
    }
}
