//! Broker wire protocol
//!
//! Newline-delimited UTF-8 JSON, one message per line:
//!
//! ```text
//! -> {"id":1,"method":"callTool","params":{"server":"fs","tool":"read","arguments":{"path":"/tmp/x"}}}
//! <- {"id":1,"result":{...}}
//! <- {"id":1,"error":{"code":"PermissionDenied","message":"..."}}
//! ```
//!
//! A line that is not JSON is answered with `id: null`. A JSON line that is
//! not a valid request echoes the id when one can be recovered.

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::fmt;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

pub const METHOD_CALL_TOOL: &str = "callTool";

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Correlation id, echoed verbatim in the response.
///
/// Any JSON number is accepted (fractions and values past `i64` included).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(Number),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{}", n),
            Self::String(s) => write!(f, "{:?}", s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n.into())
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallToolParams {
    pub server: String,
    pub tool: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub params: CallToolParams,
}

impl Request {
    pub fn call_tool(
        id: RequestId,
        server: impl Into<String>,
        tool: impl Into<String>,
        arguments: Value,
    ) -> Self {
        Self {
            id,
            method: METHOD_CALL_TOOL.to_string(),
            params: CallToolParams {
                server: server.into(),
                tool: tool.into(),
                arguments,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    ParseError,
    InvalidRequest,
    ToolExecutionFailed,
    PermissionDenied,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ParseError => "ParseError",
            Self::InvalidRequest => "InvalidRequest",
            Self::ToolExecutionFailed => "ToolExecutionFailed",
            Self::PermissionDenied => "PermissionDenied",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseBody {
    Result(Value),
    Error(RpcError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// `None` only when the request id could not be recovered
    #[serde(default)]
    pub id: Option<RequestId>,
    #[serde(flatten)]
    pub body: ResponseBody,
}

impl Response {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            id: Some(id),
            body: ResponseBody::Result(result),
        }
    }

    pub fn error(id: Option<RequestId>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            id,
            body: ResponseBody::Error(RpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        if let ResponseBody::Error(error) = &mut self.body {
            error.data = Some(data);
        }
        self
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        match &self.body {
            ResponseBody::Error(error) => Some(error.code),
            ResponseBody::Result(_) => None,
        }
    }
}

/// Encode one message as a single `\n`-terminated line
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, ProtocolError> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    Ok(line)
}

/// Decode one request line. On failure, the error response to send back.
pub fn decode_request(line: &[u8]) -> Result<Request, Response> {
    let value: Value = serde_json::from_slice(line)
        .map_err(|e| Response::error(None, ErrorCode::ParseError, format!("Invalid JSON: {}", e)))?;

    let id = value
        .get("id")
        .and_then(|id| serde_json::from_value::<RequestId>(id.clone()).ok());

    let request: Request = serde_json::from_value(value).map_err(|e| {
        Response::error(
            id.clone(),
            ErrorCode::InvalidRequest,
            format!("Invalid request: {}", e),
        )
    })?;

    if request.method != METHOD_CALL_TOOL {
        return Err(Response::error(
            Some(request.id),
            ErrorCode::InvalidRequest,
            format!("Unknown method '{}'", request.method),
        ));
    }
    Ok(request)
}

/// Decode one response line
pub fn decode_response(line: &[u8]) -> Result<Response, serde_json::Error> {
    serde_json::from_slice(line)
}

/// What [`FrameReader`] produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// One complete line, without its terminator
    Line(Vec<u8>),
    /// A line longer than the limit; its bytes were discarded
    Oversized(usize),
}

/// Splits a byte stream into lines, buffering partial reads.
///
/// Data after the last `\n` at end of stream is dropped; blank lines are
/// skipped.
pub struct FrameReader<R> {
    reader: R,
    buf: Vec<u8>,
    max_frame_bytes: usize,
}

impl<R: AsyncBufRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, max_frame_bytes: usize) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            max_frame_bytes,
        }
    }

    pub async fn next_frame(&mut self) -> io::Result<Option<Frame>> {
        loop {
            self.buf.clear();
            // +1 for the terminator
            let limit = self.max_frame_bytes as u64 + 1;
            let n = (&mut self.reader)
                .take(limit)
                .read_until(b'\n', &mut self.buf)
                .await?;
            if n == 0 {
                return Ok(None);
            }

            if self.buf.last() == Some(&b'\n') {
                self.buf.pop();
                if self.buf.last() == Some(&b'\r') {
                    self.buf.pop();
                }
                if self.buf.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                return Ok(Some(Frame::Line(std::mem::take(&mut self.buf))));
            }

            if n as u64 >= limit {
                let discarded = n + self.discard_line().await?;
                return Ok(Some(Frame::Oversized(discarded)));
            }

            // End of stream inside a frame
            return Ok(None);
        }
    }

    /// Skip to just past the next `\n`
    async fn discard_line(&mut self) -> io::Result<usize> {
        let mut discarded = 0;
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(discarded);
            }
            match available.iter().position(|b| *b == b'\n') {
                Some(pos) => {
                    self.reader.consume(pos + 1);
                    return Ok(discarded + pos + 1);
                }
                None => {
                    let len = available.len();
                    self.reader.consume(len);
                    discarded += len;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let request = Request::call_tool(7.into(), "fs", "read", json!({"path": "/tmp/x"}));
        let line = encode(&request).unwrap();
        assert_eq!(line.last(), Some(&b'\n'));
        assert_eq!(line.iter().filter(|b| **b == b'\n').count(), 1);
        let value: Value = serde_json::from_slice(&line).unwrap();
        assert_eq!(
            value,
            json!({
                "id": 7,
                "method": "callTool",
                "params": { "server": "fs", "tool": "read", "arguments": { "path": "/tmp/x" } }
            })
        );
        assert_eq!(decode_request(&line[..line.len() - 1]).unwrap(), request);
    }

    #[test]
    fn test_response_wire_shape() {
        let ok = Response::success("abc".into(), json!({"n": 1}));
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({ "id": "abc", "result": { "n": 1 } })
        );

        let err = Response::error(None, ErrorCode::ParseError, "bad");
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            json!({ "id": null, "error": { "code": "ParseError", "message": "bad" } })
        );

        let decoded = decode_response(br#"{"id":3,"error":{"code":"PermissionDenied","message":"no","data":{"missing":["fs.write"]}}}"#).unwrap();
        assert_eq!(decoded.id, Some(RequestId::from(3)));
        assert_eq!(decoded.error_code(), Some(ErrorCode::PermissionDenied));
    }

    #[test]
    fn test_decode_errors() {
        let err = decode_request(b"{not json").unwrap_err();
        assert_eq!(err.id, None);
        assert_eq!(err.error_code(), Some(ErrorCode::ParseError));

        let err = decode_request(br#"{"id":5,"method":"callTool"}"#).unwrap_err();
        assert_eq!(err.id, Some(RequestId::from(5)));
        assert_eq!(err.error_code(), Some(ErrorCode::InvalidRequest));

        let err = decode_request(
            br#"{"id":"x","method":"shutdown","params":{"server":"a","tool":"b"}}"#,
        )
        .unwrap_err();
        assert_eq!(err.id, Some(RequestId::String("x".to_string())));
        assert_eq!(err.error_code(), Some(ErrorCode::InvalidRequest));
    }

    #[test]
    fn test_any_json_number_is_an_id() {
        let request = decode_request(
            br#"{"id":1.5,"method":"callTool","params":{"server":"a","tool":"b"}}"#,
        )
        .unwrap();
        let echoed = serde_json::to_value(Response::success(request.id, Value::Null)).unwrap();
        assert_eq!(echoed["id"], json!(1.5));

        let err = decode_request(br#"{"id":18446744073709551615,"method":"callTool"}"#).unwrap_err();
        assert_eq!(err.id, Some(RequestId::Number(u64::MAX.into())));
        assert_eq!(err.error_code(), Some(ErrorCode::InvalidRequest));
        let echoed = String::from_utf8(encode(&err).unwrap()).unwrap();
        assert!(echoed.starts_with(r#"{"id":18446744073709551615,"#), "{}", echoed);
    }

    #[test]
    fn test_missing_arguments_default_to_null() {
        let request =
            decode_request(br#"{"id":1,"method":"callTool","params":{"server":"a","tool":"b"}}"#)
                .unwrap();
        assert_eq!(request.params.arguments, Value::Null);
    }

    #[tokio::test]
    async fn test_frame_reader_splits_lines() {
        let input: &[u8] = b"{\"a\":1}\n\n{\"b\":2}\r\npartial";
        let mut frames = FrameReader::new(input, 1024);
        assert_eq!(
            frames.next_frame().await.unwrap(),
            Some(Frame::Line(b"{\"a\":1}".to_vec()))
        );
        assert_eq!(
            frames.next_frame().await.unwrap(),
            Some(Frame::Line(b"{\"b\":2}".to_vec()))
        );
        assert_eq!(frames.next_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_frame_reader_reassembles_partial_reads() {
        let (mut tx, rx) = tokio::io::duplex(8);
        let writer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            for chunk in [&b"{\"id\":"[..], b"1,\"x\"", b":true}\n"] {
                tx.write_all(chunk).await.unwrap();
                tokio::task::yield_now().await;
            }
        });
        let mut frames = FrameReader::new(tokio::io::BufReader::new(rx), 1024);
        assert_eq!(
            frames.next_frame().await.unwrap(),
            Some(Frame::Line(b"{\"id\":1,\"x\":true}".to_vec()))
        );
        writer.await.unwrap();
        assert_eq!(frames.next_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_frame_reader_limits_frame_size() {
        let mut input = vec![b'x'; 40];
        input.push(b'\n');
        input.extend_from_slice(b"ok\n");
        let mut frames = FrameReader::new(input.as_slice(), 16);
        assert_eq!(frames.next_frame().await.unwrap(), Some(Frame::Oversized(41)));
        assert_eq!(
            frames.next_frame().await.unwrap(),
            Some(Frame::Line(b"ok".to_vec()))
        );
    }
}
