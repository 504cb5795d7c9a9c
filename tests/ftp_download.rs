//! End-to-end FTP download through the engine, against a minimal
//! scripted server implementing just the command subset the client
//! speaks: login, TYPE, SIZE/MDTM/REST probes, PASV, and RETR.

mod support;

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use accel::download::{AddRequest, DownloadEngine, EngineEvent};
use accel::DownloadStatus;

use support::{payload, test_config};

/// Writes one reply line on the control connection.
async fn send(writer: &mut tokio::net::tcp::OwnedWriteHalf, line: &str) {
    let _ = writer.write_all(format!("{line}\r\n").as_bytes()).await;
}

/// Serves one FTP control session: login, then answer commands until
/// QUIT or disconnect. RETR streams `data` (from the REST offset) over
/// a one-shot passive data connection.
async fn serve_session(socket: tokio::net::TcpStream, data: Arc<Vec<u8>>) {
    let (read_half, mut writer) = socket.into_split();
    let mut reader = BufReader::new(read_half);

    send(&mut writer, "220 test ftpd ready").await;

    let mut rest_offset: usize = 0;
    let mut data_listener: Option<TcpListener> = None;

    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
            return;
        }
        let line = line.trim_end();
        let (command, argument) = line.split_once(' ').unwrap_or((line, ""));

        match command.to_ascii_uppercase().as_str() {
            "USER" => send(&mut writer, "331 password required").await,
            "PASS" => send(&mut writer, "230 logged in").await,
            "TYPE" => send(&mut writer, "200 binary mode").await,
            "SIZE" => send(&mut writer, &format!("213 {}", data.len())).await,
            "MDTM" => send(&mut writer, "213 20151021072800").await,
            "REST" => {
                rest_offset = argument.parse().unwrap_or(0);
                send(&mut writer, "350 restarting").await;
            }
            "PASV" => {
                let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                let port = listener.local_addr().unwrap().port();
                data_listener = Some(listener);
                send(
                    &mut writer,
                    &format!("227 Entering Passive Mode (127,0,0,1,{},{})", port >> 8, port & 0xff),
                )
                .await;
            }
            "RETR" => {
                let Some(listener) = data_listener.take() else {
                    send(&mut writer, "425 use PASV first").await;
                    continue;
                };
                send(&mut writer, "150 opening data connection").await;
                if let Ok((mut data_socket, _)) = listener.accept().await {
                    let start = rest_offset.min(data.len());
                    let _ = data_socket.write_all(&data[start..]).await;
                    let _ = data_socket.shutdown().await;
                }
                rest_offset = 0;
                send(&mut writer, "226 transfer complete").await;
            }
            "QUIT" => {
                send(&mut writer, "221 goodbye").await;
                return;
            }
            _ => send(&mut writer, "502 not implemented").await,
        }
    }
}

/// Starts the scripted server; accepts any number of control sessions.
async fn start_ftp_server(data: Vec<u8>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let data = Arc::new(data);

    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(serve_session(socket, Arc::clone(&data)));
        }
    });

    format!("ftp://127.0.0.1:{port}/pub/tool.tar.gz")
}

#[tokio::test]
async fn test_ftp_download_end_to_end() {
    let data = payload(200 * 1024);
    let url = start_ftp_server(data.clone()).await;

    let dir = TempDir::new().unwrap();
    let engine = DownloadEngine::new(test_config(dir.path())).unwrap();
    let mut events = engine.subscribe();

    let id = engine
        .add(AddRequest {
            num_connections: Some(1),
            ..AddRequest::new(&url)
        })
        .unwrap();
    engine.start(&id).unwrap();

    loop {
        match tokio::time::timeout(Duration::from_secs(30), events.recv())
            .await
            .expect("timed out")
            .expect("event stream closed")
        {
            EngineEvent::Complete { id: event_id } if event_id == id => break,
            EngineEvent::Error { message, .. } => panic!("ftp download failed: {message}"),
            _ => {}
        }
    }

    let entry = engine.get(&id).unwrap();
    assert_eq!(entry.status, DownloadStatus::Complete);
    assert_eq!(entry.file_size, data.len() as i64);
    // The MDTM probe populated the Last-Modified validator.
    assert_eq!(entry.last_modified, "Wed, 21 Oct 2015 07:28:00 GMT");

    assert_eq!(
        std::fs::read(dir.path().join("downloads/tool.tar.gz")).unwrap(),
        data
    );
    assert!(!dir.path().join("downloads/tool.tar.gz.partial").exists());

    engine.shutdown().await;
}

#[tokio::test]
async fn test_ftp_probe_reports_metadata() {
    let data = payload(64 * 1024);
    let url = start_ftp_server(data).await;

    let dir = TempDir::new().unwrap();
    let engine = DownloadEngine::new(test_config(dir.path())).unwrap();

    let probe = engine.probe(&url).await.unwrap();
    assert_eq!(probe.info.content_length, 64 * 1024);
    assert!(probe.info.accept_ranges);
    assert_eq!(probe.suggested_name, "tool.tar.gz");
    assert_eq!(probe.category, "Compressed");

    engine.shutdown().await;
}
