use std::net::TcpStream;
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const BIN: &str = env!("CARGO_BIN_EXE_quiver-arrow");

fn arrow(args: &[&str]) -> Output {
    Command::new(BIN)
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to run quiver-arrow")
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn no_arguments_prints_version() {
    let output = arrow(&[]);

    assert_eq!(output.status.code(), Some(0));
    assert_eq!(
        stdout(&output),
        format!("quiver-arrow-rust {}\n", env!("CARGO_PKG_VERSION"))
    );
}

#[test]
fn transactions_are_refused() {
    let port = free_port().to_string();
    let output = arrow(&[
        "client", "active", "send", "arrow-1", "127.0.0.1", &port, "q0", "0", "1", "10", "10",
        "1", "",
    ]);

    assert_eq!(output.status.code(), Some(1));
    assert!(stdout(&output).is_empty());
    assert!(stderr(&output)
        .contains("quiver-arrow: error: This impl doesn't support transactions"));
}

#[test]
fn unknown_mode_is_refused() {
    let output = arrow(&[
        "peer", "active", "send", "arrow-1", "127.0.0.1", "5672", "q0", "0", "1", "10", "10",
        "0", "",
    ]);

    assert_eq!(output.status.code(), Some(1));
    assert!(stdout(&output).is_empty());
    assert!(stderr(&output).starts_with("quiver-arrow: error: "));
}

#[test]
fn refused_connection_fails_without_output() {
    let port = free_port().to_string();
    let output = arrow(&[
        "client", "active", "send", "arrow-1", "127.0.0.1", &port, "q0", "0", "3", "10", "10",
        "0", "",
    ]);

    assert_eq!(output.status.code(), Some(1));
    assert!(stdout(&output).is_empty());
    assert!(stderr(&output).contains("quiver-arrow: error: "));
}

/// A receiving server and a sending client as separate processes. The
/// readiness probe doubles as a check that servers shrug off dead
/// connections.
#[test]
fn server_and_client_processes_exchange_messages() {
    let port = free_port().to_string();
    let server = Command::new(BIN)
        .args([
            "server", "passive", "receive", "arrow-server", "127.0.0.1", &port, "q0", "10", "5",
            "32", "2", "0", "",
        ])
        .env_remove("RUST_LOG")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("failed to start server");

    let deadline = Instant::now() + Duration::from_secs(10);
    while TcpStream::connect(("127.0.0.1", port.parse::<u16>().unwrap())).is_err() {
        assert!(Instant::now() < deadline, "server never started listening");
        thread::sleep(Duration::from_millis(20));
    }

    let client = arrow(&[
        "client", "active", "send", "arrow-client", "127.0.0.1", &port, "q0", "10", "5", "32",
        "2", "0", "durable",
    ]);
    let server = server.wait_with_output().expect("server did not finish");

    assert_eq!(client.status.code(), Some(0), "{}", stderr(&client));
    assert_eq!(server.status.code(), Some(0), "{}", stderr(&server));

    let sent: Vec<Vec<String>> = stdout(&client)
        .lines()
        .map(|line| line.split(',').map(str::to_string).collect())
        .collect();
    let received: Vec<Vec<String>> = stdout(&server)
        .lines()
        .map(|line| line.split(',').map(str::to_string).collect())
        .collect();

    assert_eq!(sent.len(), 5);
    assert_eq!(received.len(), 5);
    for (sent, received) in sent.iter().zip(&received) {
        assert_eq!(sent.len(), 2);
        assert_eq!(received.len(), 3);
        assert_eq!(sent[..], received[..2]);
    }
}
