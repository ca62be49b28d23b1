//! Integration tests against an in-process websocket feed

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_test::assert_ok;
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};
use volwatch::{
    Baseline, ConnectionError, ConnectionState, FeedClient, FeedConfig, FeedHandler,
    HeartbeatConfig, Instrument, ManualClock, Monitor, MonitorBuilder, ReconnectConfig,
    StateTransition, Tick,
};

type ServerSocket = WebSocketStream<TcpStream>;

async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    (listener, url)
}

async fn accept(listener: &TcpListener) -> ServerSocket {
    let (stream, _) = listener.accept().await.unwrap();
    accept_async(stream).await.unwrap()
}

async fn next_json(ws: &mut ServerSocket) -> Value {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
            Some(Ok(_)) => continue,
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}

/// Accept the login and return the subscription request that follows it
async fn handshake(ws: &mut ServerSocket) -> Value {
    let login = next_json(ws).await;
    assert_eq!(login["Type"], "Login");
    ws.send(Message::Text(
        json!({"Type": "Login", "Data": {"ErrorMsg": ""}}).to_string(),
    ))
    .await
    .unwrap();

    let request = next_json(ws).await;
    assert_eq!(request["Type"], "TokenRequest");
    request
}

fn market_data(token: &str, ttq: u64) -> Message {
    Message::Text(json!({"Type": "MarketData", "Data": {"Tkn": token, "TTQ": ttq}}).to_string())
}

/// Read until the client closes or goes away
async fn drain(ws: &mut ServerSocket) {
    while let Some(Ok(message)) = ws.next().await {
        if message.is_close() {
            break;
        }
    }
}

fn fast_reconnect(max_attempts: u32) -> ReconnectConfig {
    ReconnectConfig {
        max_attempts,
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(40),
        backoff_multiplier: 2.0,
        jitter: false,
    }
}

fn feed_config(url: &str, max_attempts: u32) -> FeedConfig {
    FeedConfig::builder()
        .endpoint(url)
        .credentials("desk1", "secret")
        .timeout(Duration::from_secs(2))
        .reconnect(fast_reconnect(max_attempts))
        .build()
        .unwrap()
}

fn monitor() -> Arc<Monitor> {
    let clock = Arc::new(ManualClock::at((2024, 3, 4), (9, 20, 0)));
    Arc::new(
        MonitorBuilder::new()
            .clock(clock)
            .instruments(vec![Instrument::new("INFY", "101", "NSECM")])
            .baselines(HashMap::from([(
                "INFY".to_string(),
                Baseline {
                    prev_day_volume: Some(1_000.0),
                    ..Default::default()
                },
            )]))
            .build()
            .unwrap(),
    )
}

fn start_feed(
    client: &Arc<FeedClient>,
    monitor: &Arc<Monitor>,
) -> (watch::Sender<bool>, JoinHandle<Result<(), ConnectionError>>) {
    let (tx, rx) = watch::channel(false);
    let client = client.clone();
    let handler: Arc<dyn FeedHandler> = monitor.clone();
    let task = tokio::spawn(async move { client.connect(handler, rx).await });
    (tx, task)
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn live_volume(monitor: &Monitor) -> u64 {
    monitor.snapshot()[0].live_volume
}

#[tokio::test]
async fn test_handshake_ticks_and_unsubscribe() {
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let request = handshake(&mut ws).await;
        assert_eq!(request["Data"]["SubType"], true);
        assert_eq!(request["Data"]["quotes"][0]["Tkn"], "101");
        assert_eq!(request["Data"]["quotes"][0]["Xchg"], "NSECM");

        ws.send(market_data("101", 500)).await.unwrap();
        ws.send(market_data("101", 1_500)).await.unwrap();

        let unsubscribe = next_json(&mut ws).await;
        assert_eq!(unsubscribe["Type"], "TokenRequest");
        assert_eq!(unsubscribe["Data"]["SubType"], false);
        drain(&mut ws).await;
    });

    let monitor = monitor();
    let client = Arc::new(assert_ok!(FeedClient::new(feed_config(&url, 3))));
    client.subscribe(Instrument::new("INFY", "101", "NSECM"));
    let (shutdown, feed) = start_feed(&client, &monitor);

    wait_for(|| live_volume(&monitor) == 1_500).await;
    assert!(client.is_subscribed());
    assert_eq!(monitor.health().state, ConnectionState::Subscribed);
    assert_eq!(monitor.snapshot()[0].window_volume, 1_000);
    assert!(monitor
        .logs()
        .iter()
        .any(|e| e.message == "[INFY]: BELOW AVERAGES → ABOVE PREV DAY"));

    assert!(client.unsubscribe("101").is_some());
    assert!(client.subscriptions().is_empty());

    assert_ok!(shutdown.send(true));
    assert_ok!(feed.await.unwrap());
    assert_eq!(client.state(), ConnectionState::Stopped);
    server.await.unwrap_or_else(|_| panic!("feed server failed"));
}

#[tokio::test]
async fn test_resubscribes_after_reconnect() {
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        let mut first = accept(&listener).await;
        handshake(&mut first).await;
        first.send(market_data("101", 100)).await.unwrap();
        drop(first);

        let mut second = accept(&listener).await;
        let request = handshake(&mut second).await;
        assert_eq!(request["Data"]["quotes"][0]["Tkn"], "101");
        second.send(market_data("101", 900)).await.unwrap();
        drain(&mut second).await;
    });

    let monitor = monitor();
    let client = Arc::new(FeedClient::new(feed_config(&url, 3)).unwrap());
    client.subscribe(Instrument::new("INFY", "101", "NSECM"));
    let (shutdown, feed) = start_feed(&client, &monitor);

    wait_for(|| live_volume(&monitor) == 900).await;
    let health = monitor.health();
    assert!(health.reconnects >= 1);
    assert!(!health.fatal);
    assert!(health.last_error.is_some());

    assert_ok!(shutdown.send(true));
    assert_ok!(feed.await.unwrap());
    server.await.unwrap_or_else(|_| panic!("feed server failed"));
}

#[tokio::test]
async fn test_gives_up_after_max_attempts() {
    // reserve a port, then free it so every connect is refused
    let (listener, url) = bind().await;
    drop(listener);

    let monitor = monitor();
    let client = Arc::new(FeedClient::new(feed_config(&url, 3)).unwrap());
    let (_shutdown, feed) = start_feed(&client, &monitor);

    let result = tokio::time::timeout(Duration::from_secs(5), feed)
        .await
        .expect("feed kept retrying")
        .unwrap();
    assert_eq!(result, Err(ConnectionError::RetriesExhausted { attempts: 3 }));

    let health = monitor.health();
    assert!(health.fatal);
    assert_eq!(health.state, ConnectionState::Failed { attempts: 3 });
    assert_eq!(health.reconnects, 3);
    assert!(monitor.logs().iter().any(|e| e.message.starts_with("FEED FATAL")));

    // the monitor keeps serving its last state
    assert_eq!(monitor.snapshot().len(), 1);
}

#[tokio::test]
async fn test_login_rejection_is_retried_then_fatal() {
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        loop {
            let mut ws = accept(&listener).await;
            let login = next_json(&mut ws).await;
            assert_eq!(login["Data"]["LoginId"], "desk1");
            ws.send(Message::Text(
                json!({"Type": "Login", "Data": {"ErrorMsg": "Invalid credentials"}}).to_string(),
            ))
            .await
            .unwrap();
            drain(&mut ws).await;
        }
    });

    let monitor = monitor();
    let client = Arc::new(FeedClient::new(feed_config(&url, 1)).unwrap());
    let (_shutdown, feed) = start_feed(&client, &monitor);

    let result = tokio::time::timeout(Duration::from_secs(5), feed)
        .await
        .expect("feed kept retrying")
        .unwrap();
    assert_eq!(result, Err(ConnectionError::RetriesExhausted { attempts: 1 }));
    assert!(monitor.health().fatal);

    server.abort();
}

#[tokio::test]
async fn test_malformed_frames_keep_session_alive() {
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        handshake(&mut ws).await;
        ws.send(Message::Text("not json".to_string())).await.unwrap();
        ws.send(Message::Text(r#"{"Type":"MarketData","Data":{"Tkn":"101"}}"#.to_string()))
            .await
            .unwrap();
        ws.send(market_data("999", 5)).await.unwrap();
        ws.send(market_data("101", 250)).await.unwrap();
        drain(&mut ws).await;
    });

    let monitor = monitor();
    let client = Arc::new(FeedClient::new(feed_config(&url, 3)).unwrap());
    client.subscribe(Instrument::new("INFY", "101", "NSECM"));
    let (shutdown, feed) = start_feed(&client, &monitor);

    wait_for(|| live_volume(&monitor) == 250).await;
    let stats = monitor.ingest_stats();
    assert_eq!(stats.malformed_frames, 2);
    assert_eq!(stats.unknown_tokens, 1);
    assert_eq!(client.malformed_frames(), 2);
    assert_eq!(client.state(), ConnectionState::Subscribed);

    assert_ok!(shutdown.send(true));
    assert_ok!(feed.await.unwrap());
    server.await.unwrap_or_else(|_| panic!("feed server failed"));
}

/// Records every state the client passes through
#[derive(Default)]
struct StateRecorder {
    states: Mutex<Vec<ConnectionState>>,
}

impl StateRecorder {
    fn seen(&self) -> Vec<ConnectionState> {
        self.states.lock().unwrap().clone()
    }
}

impl FeedHandler for StateRecorder {
    fn on_tick(&self, _tick: Tick) {}

    fn on_state_change(&self, transition: &StateTransition) {
        self.states.lock().unwrap().push(transition.to.clone());
    }
}

#[tokio::test]
async fn test_heartbeat_then_dead_connection_reconnects() {
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        // acknowledge the login, then say nothing
        let mut silent = accept(&listener).await;
        handshake(&mut silent).await;
        let mut heartbeats = 0;
        while let Some(Ok(message)) = silent.next().await {
            match message {
                Message::Text(text) => {
                    let frame: Value = serde_json::from_str(&text).unwrap();
                    if frame["Data"]["InfoType"] == "HB" {
                        heartbeats += 1;
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }

        let mut second = accept(&listener).await;
        handshake(&mut second).await;
        heartbeats
    });

    let config = FeedConfig::builder()
        .endpoint(&url)
        .credentials("desk1", "secret")
        .timeout(Duration::from_secs(2))
        .reconnect(fast_reconnect(3))
        .heartbeat(HeartbeatConfig {
            interval: Duration::from_millis(100),
            dead_after_intervals: 3,
        })
        .build()
        .unwrap();
    let client = Arc::new(FeedClient::new(config).unwrap());
    client.subscribe(Instrument::new("INFY", "101", "NSECM"));

    let recorder = Arc::new(StateRecorder::default());
    let (shutdown, rx) = watch::channel(false);
    let handler: Arc<dyn FeedHandler> = recorder.clone();
    let feed = {
        let client = client.clone();
        tokio::spawn(async move { client.connect(handler, rx).await })
    };

    let heartbeats = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("second connection never arrived")
        .unwrap();
    assert!(heartbeats >= 1);

    let states = recorder.seen();
    let dropped = states
        .iter()
        .position(|s| *s == ConnectionState::Disconnected)
        .expect("dead connection was not detected");
    assert!(states[..dropped].contains(&ConnectionState::Subscribed));
    assert!(states[dropped..].contains(&ConnectionState::Connecting));

    assert_ok!(shutdown.send(true));
    assert_ok!(feed.await.unwrap());
}

#[tokio::test]
async fn test_second_connect_is_refused() {
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        handshake(&mut ws).await;
        drain(&mut ws).await;
    });

    let monitor = monitor();
    let client = Arc::new(FeedClient::new(feed_config(&url, 3)).unwrap());
    client.subscribe(Instrument::new("INFY", "101", "NSECM"));
    let (shutdown, feed) = start_feed(&client, &monitor);
    wait_for(|| client.is_subscribed()).await;

    let (_tx, rx) = watch::channel(false);
    let handler: Arc<dyn FeedHandler> = monitor.clone();
    assert!(matches!(
        client.connect(handler, rx).await,
        Err(ConnectionError::EstablishmentFailed(_))
    ));

    assert_ok!(shutdown.send(true));
    assert_ok!(feed.await.unwrap());
    server.await.unwrap_or_else(|_| panic!("feed server failed"));
}
