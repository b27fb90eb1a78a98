use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::thread::sleep;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use ledger_core::Workspace;

use crate::error::{io_err, DaemonError};

/// JSON newline-delimited request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonRequest {
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
}

impl DaemonRequest {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            entity: None,
        }
    }

    pub fn for_entity(cmd: impl Into<String>, entity: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            entity: Some(entity.into()),
        }
    }
}

/// JSON newline-delimited response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DaemonResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Send one JSON request to the workspace's daemon socket and return one response.
pub fn send_request(
    workspace: &Workspace,
    request: &DaemonRequest,
) -> Result<DaemonResponse, DaemonError> {
    let socket = workspace.socket_path();
    if !socket.exists() {
        return Err(DaemonError::DaemonNotRunning { socket });
    }

    let mut stream = UnixStream::connect(&socket).map_err(|err| {
        if matches!(
            err.kind(),
            std::io::ErrorKind::NotFound
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
        ) {
            DaemonError::DaemonNotRunning {
                socket: socket.clone(),
            }
        } else {
            io_err(&socket, err)
        }
    })?;

    let payload = serde_json::to_string(request)?;
    stream
        .write_all(payload.as_bytes())
        .map_err(|e| io_err(&socket, e))?;
    stream.write_all(b"\n").map_err(|e| io_err(&socket, e))?;
    stream.flush().map_err(|e| io_err(&socket, e))?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    let read = reader
        .read_line(&mut line)
        .map_err(|e| io_err(&socket, e))?;
    if read == 0 {
        return Err(DaemonError::Protocol(
            "daemon closed connection before responding".to_string(),
        ));
    }

    let response: DaemonResponse = serde_json::from_str(line.trim_end())?;
    Ok(response)
}

/// Daemon status, retrying briefly while the socket comes up.
pub fn request_status(workspace: &Workspace) -> Result<Value, DaemonError> {
    let request = DaemonRequest::new("status");

    let mut last_not_running: Option<DaemonError> = None;
    for attempt in 0..5 {
        match send_request(workspace, &request) {
            Ok(response) => return response_into_data(response),
            Err(err @ DaemonError::DaemonNotRunning { .. }) => {
                last_not_running = Some(err);
                if attempt < 4 {
                    sleep(Duration::from_millis(100));
                    continue;
                }
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_not_running.unwrap_or_else(|| {
        DaemonError::Protocol("daemon status retry loop exited unexpectedly".to_string())
    }))
}

pub fn request_regenerate(workspace: &Workspace, entity: &str) -> Result<Value, DaemonError> {
    let response = send_request(workspace, &DaemonRequest::for_entity("regenerate", entity))?;
    response_into_data(response)
}

pub fn request_reconcile(workspace: &Workspace, entity: &str) -> Result<Value, DaemonError> {
    let response = send_request(workspace, &DaemonRequest::for_entity("reconcile", entity))?;
    response_into_data(response)
}

pub fn request_stop(workspace: &Workspace) -> Result<(), DaemonError> {
    let response = send_request(workspace, &DaemonRequest::new("stop"))?;
    response_into_data(response).map(|_| ())
}

fn response_into_data(response: DaemonResponse) -> Result<Value, DaemonError> {
    if response.ok {
        Ok(response.data.unwrap_or(Value::Null))
    } else {
        Err(DaemonError::Protocol(
            response
                .error
                .unwrap_or_else(|| "unknown daemon error".to_string()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn entity_is_omitted_when_absent() {
        let encoded = serde_json::to_value(DaemonRequest::new("status")).unwrap();
        assert_eq!(encoded, json!({"cmd": "status"}));
        let encoded = serde_json::to_value(DaemonRequest::for_entity("state", "acme")).unwrap();
        assert_eq!(encoded, json!({"cmd": "state", "entity": "acme"}));
    }

    #[test]
    fn error_response_becomes_protocol_error() {
        let err = response_into_data(DaemonResponse::error("unknown entity 'nope'")).unwrap_err();
        assert!(matches!(err, DaemonError::Protocol(msg) if msg.contains("nope")));
        assert_eq!(
            response_into_data(DaemonResponse::ok(json!({"x": 1}))).unwrap(),
            json!({"x": 1})
        );
    }

    #[test]
    fn missing_socket_means_not_running() {
        let tmp = tempfile::TempDir::new().unwrap();
        let err = send_request(&Workspace::new(tmp.path()), &DaemonRequest::new("status"))
            .unwrap_err();
        assert!(matches!(err, DaemonError::DaemonNotRunning { .. }));
    }
}
