use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use waterheater::clock::ManualClock;
use waterheater::config::ServerConfig;
use waterheater::protocol::parse_status;
use waterheater::server::Server;
use waterheater::session::Session;
use waterheater::simulation::{Mode, Simulation, SimulationParams, Snapshot};

const QUIET_INTERVAL: Duration = Duration::from_secs(3600);
const READ_TIMEOUT: Duration = Duration::from_secs(5);

fn manual_sim() -> (Arc<Simulation>, ManualClock) {
    let clock = ManualClock::new(1_000_000_000);
    let params = SimulationParams::new(200_000.0, 2000.0, 20.0, 20.0);
    let sim = Simulation::with_clock(params, clock.clone()).unwrap();
    (Arc::new(sim), clock)
}

async fn spawn_server(sim: Arc<Simulation>, status_interval: Duration) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = ServerConfig {
        port: 0,
        status_interval,
        ..ServerConfig::default()
    };
    let server = Server::from_listener(listener, sim, config);
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    addr
}

struct Client {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Client {
    /// Connects and consumes the status line pushed on connect.
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, writer) = stream.into_split();
        let mut client = Self {
            lines: BufReader::new(reader).lines(),
            writer,
        };
        let greeting = client.read_line().await;
        assert!(greeting.starts_with("status "), "unexpected greeting: {}", greeting);
        client
    }

    async fn read_line(&mut self) -> String {
        timeout(READ_TIMEOUT, self.lines.next_line())
            .await
            .expect("timed out waiting for a line")
            .unwrap()
            .expect("connection closed")
    }

    async fn send(&mut self, raw: &str) -> String {
        self.writer.write_all(raw.as_bytes()).await.unwrap();
        self.read_line().await
    }

    async fn status(&mut self, raw: &str) -> Snapshot {
        let line = self.send(raw).await;
        parse_status(&line).unwrap()
    }

    /// Skips broadcast lines until one reports `mode`.
    async fn await_mode(&mut self, mode: Mode) -> Snapshot {
        let lines = &mut self.lines;
        let wait = async {
            loop {
                let line = lines.next_line().await.unwrap().expect("connection closed");
                let snapshot = parse_status(&line).unwrap();
                if snapshot.mode == mode {
                    return snapshot;
                }
            }
        };
        timeout(READ_TIMEOUT, wait).await.expect("timed out waiting for mode")
    }
}

#[tokio::test]
async fn test_control_and_request_round_trip() {
    let (sim, _clock) = manual_sim();
    let addr = spawn_server(Arc::clone(&sim), QUIET_INTERVAL).await;
    let mut client = Client::connect(addr).await;

    assert_eq!(client.status("control on\n").await.mode, Mode::Heating);
    assert_eq!(client.status("request\n").await.mode, Mode::Heating);
    assert_eq!(sim.snapshot().mode, Mode::Heating);

    assert_eq!(client.status("control off\n").await.mode, Mode::Cooling);
    assert_eq!(client.status("request\n").await.mode, Mode::Cooling);
    assert_eq!(sim.snapshot().mode, Mode::Cooling);
}

#[tokio::test]
async fn test_status_line_format() {
    let (sim, _clock) = manual_sim();
    let addr = spawn_server(sim, QUIET_INTERVAL).await;
    let mut client = Client::connect(addr).await;

    assert_eq!(client.send("request\n").await, "status 20.000000 OFF 1000000000");
    assert_eq!(client.send("control on\n").await, "status 20.000000 ON 1000000000");
}

#[tokio::test]
async fn test_commands_are_case_insensitive_and_accept_crlf() {
    let (sim, _clock) = manual_sim();
    let addr = spawn_server(sim, QUIET_INTERVAL).await;
    let mut client = Client::connect(addr).await;

    assert_eq!(client.status("CONTROL ON\r\n").await.mode, Mode::Heating);
    assert_eq!(client.status("Control Off\r\n").await.mode, Mode::Cooling);
    assert_eq!(client.status("ReQuEsT\r\n").await.mode, Mode::Cooling);
}

#[tokio::test]
async fn test_unknown_command_replies_error() {
    let (sim, _clock) = manual_sim();
    let before = sim.snapshot();
    let addr = spawn_server(Arc::clone(&sim), QUIET_INTERVAL).await;
    let mut client = Client::connect(addr).await;

    assert_eq!(client.send("foobar\n").await, "error");
    assert_eq!(client.send("\n").await, "error");
    assert_eq!(sim.snapshot(), before);

    // the connection stays usable
    assert_eq!(client.status("request\n").await.mode, Mode::Cooling);
}

#[tokio::test]
async fn test_oversized_line_replies_error() {
    let (sim, _clock) = manual_sim();
    let addr = spawn_server(sim, QUIET_INTERVAL).await;
    let mut client = Client::connect(addr).await;

    let long = format!("{}\n", "x".repeat(2048));
    assert_eq!(client.send(&long).await, "error");

    // the rest of the long line is dropped, not answered again
    assert_eq!(client.status("request\n").await.mode, Mode::Cooling);

    let longest = format!("request{}\r\n", " ".repeat(505));
    assert_eq!(client.status(&longest).await.mode, Mode::Cooling);
}

#[tokio::test]
async fn test_unterminated_flood_is_rejected_before_newline() {
    let (sim, _clock) = manual_sim();
    let (client, server) = tokio::io::duplex(1024);
    let (server_read, server_write) = tokio::io::split(server);
    let session = Session::new(sim, "127.0.0.1:9".parse().unwrap(), QUIET_INTERVAL);
    let handle = tokio::spawn(session.run(server_read, server_write));

    let (client_read, mut client_write) = tokio::io::split(client);
    let mut lines = BufReader::new(client_read).lines();

    // far more than the line limit, and no terminator yet
    let chunk = vec![b'x'; 64 * 1024];
    for _ in 0..16 {
        timeout(READ_TIMEOUT, client_write.write_all(&chunk)).await.unwrap().unwrap();
    }

    let mut saw_error = false;
    for _ in 0..2 {
        let line = timeout(READ_TIMEOUT, lines.next_line()).await.unwrap().unwrap().unwrap();
        if line == "error" {
            saw_error = true;
            break;
        }
        assert!(parse_status(&line).is_ok(), "unexpected line: {}", line);
    }
    assert!(saw_error);

    // finishing the flood and sending a command gets a normal reply
    client_write.write_all(b"\ncontrol on\n").await.unwrap();
    loop {
        let line = timeout(READ_TIMEOUT, lines.next_line()).await.unwrap().unwrap().unwrap();
        assert_ne!(line, "error");
        if parse_status(&line).unwrap().mode == Mode::Heating {
            break;
        }
    }

    client_write.shutdown().await.unwrap();
    let result = timeout(READ_TIMEOUT, handle).await.unwrap().unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_heating_scenario_over_the_wire() {
    let (sim, clock) = manual_sim();
    let addr = spawn_server(Arc::clone(&sim), QUIET_INTERVAL).await;
    let mut client = Client::connect(addr).await;

    client.status("control on\n").await;
    clock.advance_secs(36.0);
    sim.step().unwrap();

    let snapshot = client.status("request\n").await;
    assert!((snapshot.water_temp_c - 20.086_083).abs() < 1e-5);
    assert_eq!(snapshot.mode, Mode::Heating);
    assert_eq!(snapshot.timestamp_ns, 37_000_000_000);
}

#[tokio::test]
async fn test_status_is_broadcast_periodically() {
    let (sim, _clock) = manual_sim();
    let addr = spawn_server(sim, Duration::from_millis(20)).await;
    let mut client = Client::connect(addr).await;

    for _ in 0..3 {
        let line = client.read_line().await;
        assert!(parse_status(&line).is_ok(), "not a status line: {}", line);
    }
}

#[tokio::test]
async fn test_control_is_visible_to_other_sessions() {
    let (sim, _clock) = manual_sim();
    let addr = spawn_server(Arc::clone(&sim), QUIET_INTERVAL).await;

    let mut first = Client::connect(addr).await;
    let mut second = Client::connect(addr).await;
    let mut controller = Client::connect(addr).await;

    assert_eq!(controller.status("control on\n").await.mode, Mode::Heating);
    let (a, b) = tokio::join!(first.status("request\n"), second.status("request\n"));
    assert_eq!(a.mode, Mode::Heating);
    assert_eq!(b.mode, Mode::Heating);

    assert_eq!(controller.status("control off\n").await.mode, Mode::Cooling);
    let (a, b) = tokio::join!(first.status("request\n"), second.status("request\n"));
    assert_eq!(a.mode, Mode::Cooling);
    assert_eq!(b.mode, Mode::Cooling);
}

#[tokio::test]
async fn test_disconnect_does_not_affect_other_sessions() {
    let (sim, _clock) = manual_sim();
    let addr = spawn_server(sim, Duration::from_millis(10)).await;

    let leaving = Client::connect(addr).await;
    let mut staying = Client::connect(addr).await;
    drop(leaving);

    tokio::time::sleep(Duration::from_millis(50)).await;
    staying.writer.write_all(b"control on\n").await.unwrap();
    assert_eq!(staying.await_mode(Mode::Heating).await.mode, Mode::Heating);

    // broadcasts keep arriving after the other client left
    let line = staying.read_line().await;
    assert!(parse_status(&line).is_ok(), "not a status line: {}", line);
}

#[tokio::test]
async fn test_session_ends_when_peer_closes() {
    let (sim, _clock) = manual_sim();
    let (client, server) = tokio::io::duplex(1024);
    let (server_read, server_write) = tokio::io::split(server);
    let session = Session::new(sim, "127.0.0.1:9".parse().unwrap(), Duration::from_millis(5));

    let handle = tokio::spawn(session.run(server_read, server_write));

    let (client_read, mut client_write) = tokio::io::split(client);
    let mut lines = BufReader::new(client_read).lines();
    client_write.write_all(b"control on\n").await.unwrap();

    let mut saw_on = false;
    for _ in 0..10 {
        let line = timeout(READ_TIMEOUT, lines.next_line()).await.unwrap().unwrap().unwrap();
        if parse_status(&line).unwrap().mode == Mode::Heating {
            saw_on = true;
            break;
        }
    }
    assert!(saw_on);

    // closing our write half ends the handler; the broadcaster is joined with it
    client_write.shutdown().await.unwrap();
    let result = timeout(READ_TIMEOUT, handle).await.unwrap().unwrap();
    assert!(result.is_ok());
}
