use intrace::agent::{Agent, UnitDescriptor};
use intrace::client::{ControlChannel, ControlListener};
use intrace::domain::{PassProgress, UnitCounts};
use intrace_common::{
    read_frame, write_frame, Message, GET_SETTINGS, HELP, KEY_NETWORK_PORT, KEY_NUM_INSTRUMENTED,
    LIST_MODIFIED, NETWORK_PORT, REPLY_OK,
};
use std::collections::BTreeMap;
use std::io::{BufReader, Write};
use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(10));
    }
}

struct RawClient {
    writer: TcpStream,
    reader: BufReader<TcpStream>,
}

impl RawClient {
    fn connect(agent: &Agent) -> Self {
        let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, agent.control_port())).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let reader = BufReader::new(stream.try_clone().unwrap());
        Self { writer: stream, reader }
    }

    fn send(&mut self, command: &str) {
        write_frame(&mut self.writer, &Message::Text(command.to_string())).unwrap();
    }

    fn next(&mut self) -> Message {
        read_frame(&mut self.reader).unwrap()
    }

    /// Next text or command-set reply, skipping pushed frames
    fn reply(&mut self) -> Message {
        loop {
            match self.next() {
                reply @ (Message::Text(_) | Message::Commands(_)) => return reply,
                _ => {}
            }
        }
    }

    fn settings(&mut self) -> BTreeMap<String, String> {
        loop {
            if let Message::Settings(map) = self.next() {
                return map;
            }
        }
    }
}

fn agent(args: &str) -> Agent {
    Agent::start(&format!("[serverport-0{args}")).expect("Failed to start agent")
}

#[test]
fn test_getsettings_is_broadcast_to_every_client() {
    let agent = agent("");
    let mut a = RawClient::connect(&agent);
    let mut b = RawClient::connect(&agent);
    wait_until("both connections", || agent.connection_count() == 2);

    a.send(GET_SETTINGS);
    let pushed = b.settings();
    let own = a.settings();

    assert_eq!(pushed, own);
    assert_eq!(pushed.get(KEY_NETWORK_PORT), Some(&agent.trace_port().to_string()));
    assert_eq!(pushed.get("[instru-").map(String::as_str), Some("true"));
}

#[test]
fn test_replies_to_help_unknown_and_network_port() {
    let agent = agent("");
    let mut client = RawClient::connect(&agent);

    client.send(HELP);
    let Message::Commands(tokens) = client.reply() else {
        panic!("help should answer with the command set");
    };
    assert!(tokens.iter().any(|t| t == "[instru-true"));
    assert!(tokens.iter().any(|t| t == GET_SETTINGS));

    client.send("[no-such-command");
    assert_eq!(client.reply(), Message::Text(REPLY_OK.to_string()));

    client.send(NETWORK_PORT);
    assert_eq!(client.reply(), Message::Text(agent.trace_port().to_string()));
}

#[test]
fn test_mutation_reply_and_status_push() {
    let agent = agent("");
    agent.load_unit(UnitDescriptor::new("com.foo.Bar"));
    agent.load_unit(UnitDescriptor::new("com.foo.BarTest"));
    let mut client = RawClient::connect(&agent);

    client.send("[regex-com.*[excluderegex-*Test");
    let mut status = None;
    let reply = loop {
        match client.next() {
            Message::Status { instrumented, total } => status = Some((instrumented, total)),
            Message::Text(text) => break text,
            _ => {}
        }
    };
    assert_eq!(reply, REPLY_OK);
    assert_eq!(status, Some((1, 2)));

    client.send(LIST_MODIFIED);
    assert_eq!(client.reply(), Message::Text("[com.foo.Bar]".to_string()));

    client.send(GET_SETTINGS);
    assert_eq!(client.settings().get(KEY_NUM_INSTRUMENTED).map(String::as_str), Some("1"));
}

#[test]
fn test_callers_pattern_is_taken_literally() {
    let agent = agent("");
    let mut client = RawClient::connect(&agent);
    client.send("[callers-start-(");
    // Globs escape regex syntax, so even this is accepted
    assert_eq!(client.reply(), Message::Text(REPLY_OK.to_string()));
    assert_eq!(agent.settings().callers_pattern.as_deref(), Some("("));
}

#[test]
fn test_disconnect_removes_connection() {
    let agent = agent("");
    let mut kept = RawClient::connect(&agent);
    let dropped = RawClient::connect(&agent);
    wait_until("both connections", || agent.connection_count() == 2);

    drop(dropped);
    wait_until("connection removal", || agent.connection_count() == 1);

    kept.send(GET_SETTINGS);
    assert!(!kept.settings().is_empty());
}

#[test]
fn test_oversize_frame_ends_only_that_session() {
    let agent = agent("");
    let mut good = RawClient::connect(&agent);
    let mut bad = RawClient::connect(&agent);
    wait_until("both connections", || agent.connection_count() == 2);

    bad.writer.write_all(&u32::MAX.to_be_bytes()).unwrap();
    bad.writer.flush().unwrap();
    wait_until("bad connection removal", || agent.connection_count() == 1);

    good.send(HELP);
    assert!(matches!(good.reply(), Message::Commands(_)));
}

#[test]
fn test_callback_and_start_wait() {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let port = listener.local_addr().unwrap().port();
    let starter = thread::spawn(move || agent(&format!("[callbackport-{port}[startwait")));

    let (stream, _) = listener.accept().unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut client = RawClient { reader: BufReader::new(stream.try_clone().unwrap()), writer: stream };
    client.send(intrace_common::START);
    assert_eq!(client.reply(), Message::Text(REPLY_OK.to_string()));

    let agent = starter.join().unwrap();
    assert_eq!(agent.connection_count(), 1);
    client.send(GET_SETTINGS);
    assert!(client.settings().contains_key(KEY_NETWORK_PORT));
}

#[derive(Default)]
struct Recorder {
    settings: Mutex<Vec<BTreeMap<String, String>>>,
    disconnects: Mutex<Vec<Option<String>>>,
}

impl ControlListener for Recorder {
    fn settings(&self, settings: &BTreeMap<String, String>) {
        self.settings.lock().unwrap().push(settings.clone());
    }

    fn progress(&self, _progress: PassProgress) {}

    fn status(&self, _counts: UnitCounts) {}

    fn disconnected(&self, error: Option<String>) {
        self.disconnects.lock().unwrap().push(error);
    }
}

#[test]
fn test_control_channel_half_duplex_exchange() {
    let agent = agent("");
    let recorder = Arc::new(Recorder::default());
    let channel =
        ControlChannel::connect(&format!("127.0.0.1:{}", agent.control_port()), recorder.clone()).unwrap();

    channel.send_message(GET_SETTINGS).unwrap();
    // No text reply is owed for getsettings, so this does not wait
    assert_eq!(channel.request(NETWORK_PORT).unwrap(), agent.trace_port().to_string());
    wait_until("settings push", || !recorder.settings.lock().unwrap().is_empty());

    let help = channel.request(HELP).unwrap();
    assert!(help.lines().any(|token| token == "[verbose-false"));

    // An unread reply is discarded before the next command
    channel.send_message("[trace-args-false").unwrap();
    assert_eq!(channel.request(NETWORK_PORT).unwrap(), agent.trace_port().to_string());

    channel.disconnect();
    // The reader has finished by the time disconnect returns
    assert_eq!(*recorder.disconnects.lock().unwrap(), vec![None]);
    channel.disconnect();
    assert_eq!(recorder.disconnects.lock().unwrap().len(), 1);
    assert!(channel.request(HELP).is_err());
}

#[test]
fn test_agent_shutdown_is_reported_as_error() {
    let agent = agent("");
    let recorder = Arc::new(Recorder::default());
    let _channel =
        ControlChannel::connect(&format!("127.0.0.1:{}", agent.control_port()), recorder.clone()).unwrap();
    wait_until("connection", || agent.connection_count() == 1);

    agent.shutdown();
    wait_until("disconnect notification", || !recorder.disconnects.lock().unwrap().is_empty());
    assert!(recorder.disconnects.lock().unwrap()[0].is_some());
}
