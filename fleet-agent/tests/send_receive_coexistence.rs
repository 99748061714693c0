//! The send transaction must coexist with an active listener on the same
//! port: the listener's OS handle closes before the sender's dialog, and
//! the listener reopens and re-initializes afterwards.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

use fleet_agent::receiver::{AutoHangupConfig, SmsReceiver};
use fleet_agent::sender::SmsSender;
use fleet_agent::session::{CommandLocks, PortArbiter, PortOpener};
use fleet_types::ListenerPort;

struct PipeOpener {
    streams: mpsc::UnboundedSender<DuplexStream>,
    opens: Arc<AtomicUsize>,
}

impl PortOpener for PipeOpener {
    type Stream = DuplexStream;

    fn open(&self, _port: &str, _baud: u32) -> Result<DuplexStream> {
        let (agent, modem) = tokio::io::duplex(8192);
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.streams
            .send(modem)
            .map_err(|_| anyhow::anyhow!("modem receiver dropped"))?;
        Ok(agent)
    }

    fn enumerate(&self) -> Result<Vec<String>> {
        Ok(vec!["COM5".into()])
    }
}

/// Read until `needle` appears, failing after 5 s.
async fn expect_read(modem: &mut DuplexStream, needle: &str) -> String {
    let mut collected = String::new();
    let mut buf = [0u8; 512];
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        assert!(!remaining.is_zero(), "timed out waiting for {needle:?}; saw {collected:?}");
        match tokio::time::timeout(remaining, modem.read(&mut buf)).await {
            Ok(Ok(0)) => panic!("port closed while waiting for {needle:?}; saw {collected:?}"),
            Ok(Ok(n)) => {
                collected.push_str(&String::from_utf8_lossy(&buf[..n]));
                if collected.contains(needle) {
                    return collected;
                }
            }
            Ok(Err(e)) => panic!("modem read failed: {e}"),
            Err(_) => panic!("timed out waiting for {needle:?}; saw {collected:?}"),
        }
    }
}

/// Answer the receiver init sequence (`ATE0` ... `AT+CSCS="GSM"`).
async fn serve_receiver_init(modem: &mut DuplexStream) {
    for expected in ["ATE0", "AT+CMGF=1", "AT+CNMI=2,2,0,0,0", "AT+CSCS=\"GSM\""] {
        expect_read(modem, expected).await;
        modem.write_all(b"\r\nOK\r\n").await.unwrap();
    }
}

#[tokio::test]
async fn test_send_transaction_pauses_and_resumes_listener() {
    let (stream_tx, mut stream_rx) = mpsc::unbounded_channel();
    let opens = Arc::new(AtomicUsize::new(0));
    let opener = Arc::new(PipeOpener {
        streams: stream_tx,
        opens: Arc::clone(&opens),
    });

    let (sms_tx, mut sms_rx) = mpsc::unbounded_channel();
    let (hangup_tx, _hangup_rx) = mpsc::unbounded_channel();
    let receiver = Arc::new(SmsReceiver::new(
        "edge-01".into(),
        Arc::clone(&opener),
        CommandLocks::new(),
        AutoHangupConfig::default(),
        sms_tx,
        hangup_tx,
    ));

    let arbiter = Arc::new(PortArbiter::new());
    arbiter.set_pauser(Arc::new(receiver.handle())).await;
    let sender = SmsSender::new(Arc::clone(&opener), Arc::clone(&arbiter));

    // listener up on COM5
    receiver
        .start_listening(&[ListenerPort {
            port_name: "COM5".into(),
            baud_rate: 115200,
        }])
        .await;
    let mut listener_modem = stream_rx.recv().await.expect("listener never opened");
    serve_receiver_init(&mut listener_modem).await;
    assert_eq!(opens.load(Ordering::SeqCst), 1);

    // kick off the send while the listener is active
    let send_task = tokio::spawn({
        let sender_port = "COM5".to_string();
        async move { sender.send_sms(&sender_port, "+15550001111", "hi").await }
    });

    // the listener's handle must close before the sender opens the port
    let mut buf = [0u8; 16];
    let eof = tokio::time::timeout(Duration::from_secs(5), listener_modem.read(&mut buf))
        .await
        .expect("listener handle was not closed for the send");
    assert_eq!(eof.unwrap(), 0, "listener handle still open");
    assert_eq!(
        opens.load(Ordering::SeqCst),
        1,
        "sender opened the port before the listener released it"
    );

    // serve the sender's dialog on the second open
    let mut sender_modem = stream_rx.recv().await.expect("sender never opened");
    assert_eq!(opens.load(Ordering::SeqCst), 2);
    for expected in ["AT", "ATE0", "AT+CMGF=1", "AT+CSCS=\"UCS2\""] {
        expect_read(&mut sender_modem, expected).await;
        sender_modem.write_all(b"\r\nOK\r\n").await.unwrap();
    }
    expect_read(&mut sender_modem, "AT+CMGS=\"+15550001111\"").await;
    sender_modem.write_all(b"\r\n> ").await.unwrap();
    expect_read(&mut sender_modem, "\u{1a}").await;
    sender_modem
        .write_all(b"\r\n+CMGS: 12\r\n\r\nOK\r\n")
        .await
        .unwrap();

    // the listener reopens and replays its init sequence on resume; this
    // must be served before the send call can return, because resume only
    // acknowledges once the port is re-initialized
    let mut resumed_modem = stream_rx.recv().await.expect("listener never resumed");
    serve_receiver_init(&mut resumed_modem).await;
    assert_eq!(opens.load(Ordering::SeqCst), 3);

    let outcome = send_task.await.unwrap();
    assert!(outcome.ok, "send failed: {:?}", outcome.error_message);

    // messages arriving strictly after resume are decoded normally
    resumed_modem
        .write_all(b"+CMT: \"+15551234567\",,\"25/06/01,10:00:00+00\"\r\nafter resume\r\n")
        .await
        .unwrap();
    let sms = tokio::time::timeout(Duration::from_secs(3), sms_rx.recv())
        .await
        .expect("no SMS after resume")
        .expect("sms channel closed");
    assert_eq!(sms.message_content, "after resume");
    assert_eq!(sms.com_port, "COM5");

    receiver.stop_listening().await;
}
