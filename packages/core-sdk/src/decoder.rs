use serde_json::Value;

/**
 * \brief 按行增量解码 NDJSON。
 * \details 仅以 `\n` 切分，尾部不完整的行保留到下一次 consume；
 *          以字节缓冲，跨块截断的多字节 UTF-8 字符不会被破坏。
 */
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    buf: Vec<u8>,
    /** \brief buf 中已确认不含换行的前缀长度 */
    scanned: usize,
    malformed: usize,
}

impl NdjsonDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /**
     * \brief 喂入一段字节，返回其中所有完整行解析出的对象（按顺序）。
     */
    pub fn consume(&mut self, bytes: &[u8]) -> Vec<Value> {
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();
        let mut start = 0;
        while let Some(rel) = self.buf[self.scanned..].iter().position(|b| *b == b'\n') {
            let end = self.scanned + rel;
            if let Some(value) = parse_line(&self.buf[start..end], &mut self.malformed) {
                out.push(value);
            }
            start = end + 1;
            self.scanned = start;
        }
        self.buf.drain(..start);
        self.scanned = self.buf.len();
        out
    }

    /**
     * \brief 响应结束时解析最后一条未以换行结尾的行。
     */
    pub fn finish(&mut self) -> Vec<Value> {
        let rest = std::mem::take(&mut self.buf);
        self.scanned = 0;
        parse_line(&rest, &mut self.malformed).into_iter().collect()
    }

    /** \brief 已跳过的坏行数量。 */
    pub fn malformed_lines(&self) -> usize {
        self.malformed
    }
}

fn parse_line(line: &[u8], malformed: &mut usize) -> Option<Value> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(text) {
        Ok(value) => Some(value),
        Err(err) => {
            *malformed += 1;
            tracing::warn!(error = %err, len = text.len(), "skipping malformed upstream line");
            None
        }
    }
}

/**
 * \brief 提取内容行的文本：仅 `markdown-chat` 且 value 为非空字符串。
 */
pub fn content_of(value: &Value) -> Option<&str> {
    if value.get("type").and_then(Value::as_str) != Some("markdown-chat") {
        return None;
    }
    value
        .get("value")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const BODY: &str = concat!(
        "{\"type\":\"markdown-chat\",\"value\":\"Hel\"}\n",
        "{\"type\":\"record-map\",\"recordMap\":{}}\n",
        "not json at all\n",
        "\n",
        "{\"type\":\"markdown-chat\",\"value\":\"lo ✓\"}\n",
    );

    fn decode_in_pieces(body: &[u8], sizes: &[usize]) -> Vec<Value> {
        let mut decoder = NdjsonDecoder::new();
        let mut out = Vec::new();
        let mut rest = body;
        let mut i = 0;
        while !rest.is_empty() {
            let n = sizes[i % sizes.len()].min(rest.len());
            out.extend(decoder.consume(&rest[..n]));
            rest = &rest[n..];
            i += 1;
        }
        out.extend(decoder.finish());
        out
    }

    #[test]
    fn test_whole_body() {
        let mut decoder = NdjsonDecoder::new();
        let values = decoder.consume(BODY.as_bytes());
        assert_eq!(values.len(), 3);
        assert_eq!(decoder.malformed_lines(), 1);
        let texts: Vec<&str> = values.iter().filter_map(content_of).collect();
        assert_eq!(texts, vec!["Hel", "lo ✓"]);
    }

    #[test]
    fn test_arbitrary_splits_match_single_chunk() {
        let whole = decode_in_pieces(BODY.as_bytes(), &[BODY.len()]);
        let splits: [&[usize]; 5] = [&[1], &[2, 3], &[7], &[5, 1, 13], &[40]];
        for sizes in splits {
            assert_eq!(decode_in_pieces(BODY.as_bytes(), sizes), whole, "sizes {:?}", sizes);
        }
    }

    #[test]
    fn test_partial_line_is_retained() {
        let mut decoder = NdjsonDecoder::new();
        assert!(decoder.consume(b"{\"type\":\"markdown-").is_empty());
        let values = decoder.consume(b"chat\",\"value\":\"x\"}\n{\"a\"");
        assert_eq!(values, vec![json!({"type": "markdown-chat", "value": "x"})]);
        let tail = decoder.consume(b":1}");
        assert!(tail.is_empty());
        assert_eq!(decoder.finish(), vec![json!({"a": 1})]);
    }

    #[test]
    fn test_long_line_in_small_pieces_is_scanned_once() {
        let text = "x".repeat(64 * 1024);
        let line = format!("{{\"type\":\"markdown-chat\",\"value\":\"{}\"}}\n", text);
        let bytes = line.as_bytes();
        let mut decoder = NdjsonDecoder::new();
        let mut values = Vec::new();
        for piece in bytes.chunks(3) {
            values.extend(decoder.consume(piece));
            assert_eq!(decoder.scanned, decoder.buf.len());
        }
        assert!(decoder.buf.is_empty());
        assert_eq!(values.len(), 1);
        assert_eq!(content_of(&values[0]), Some(text.as_str()));
    }

    #[test]
    fn test_content_of_filters_kinds() {
        assert_eq!(content_of(&json!({"type": "markdown-chat", "value": "a"})), Some("a"));
        assert_eq!(content_of(&json!({"type": "markdown-chat", "value": ""})), None);
        assert_eq!(content_of(&json!({"type": "markdown-chat", "value": 3})), None);
        assert_eq!(content_of(&json!({"type": "title", "value": "a"})), None);
    }
}
