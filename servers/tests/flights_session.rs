use axum::{Form, Json, Router, routing::post};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, Message};

use lib_flights::auth::IntrospectionAuthorizer;
use lib_flights::source::MemoryConnector;
use lib_flights::{DedupCache, FlightRecord, SessionCoordinator, SessionSettings};
use nearby_servers::flights_logic::downstream;
use nearby_servers::flights_logic::model::FlightMessage;
use nearby_servers::flights_logic::state::AppState;

// coordinates in the middle of the Pacific Ocean
const LAT: f64 = 7.067274;
const LON: f64 = 220.202269;

const VALID_TOKEN: &str = "valid-token";

async fn introspect(Form(form): Form<HashMap<String, String>>) -> Json<Value> {
    if form.get("token").map(String::as_str) == Some(VALID_TOKEN) {
        Json(json!({
            "active": true,
            "client_id": "my-client",
            "sub": "my-client",
            "token_type": "access_token"
        }))
    } else {
        Json(json!({ "active": false }))
    }
}

/// Starts a mock introspection endpoint and returns its URL.
async fn start_introspection() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new().route("/oauth2/introspect", post(introspect));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}/oauth2/introspect", addr)
}

struct TestServer {
    addr: SocketAddr,
    connector: MemoryConnector,
    app_state: AppState<MemoryConnector>,
    server_shutdown: broadcast::Sender<()>,
}

/// Starts the flights server on a random port. The HTTP listener stops on
/// `server_shutdown`; sessions stop on `app_state.shutdown()`.
async fn start_server() -> TestServer {
    let connector = MemoryConnector::new(vec![FlightRecord {
        icao24: "123456".to_string(),
        call_sign: "test-flight".to_string(),
        country: "BR".to_string(),
        latitude: LAT,
        longitude: LON,
        velocity: 10.0,
    }]);

    let authorizer = IntrospectionAuthorizer::new(&start_introspection().await, 0).unwrap();
    let coordinator = SessionCoordinator::new(
        Arc::new(connector.clone()),
        Arc::new(DedupCache::new()),
        SessionSettings::default(),
    );
    let (session_shutdown, _) = broadcast::channel(1);
    let app_state = AppState::new(Arc::new(authorizer), coordinator, session_shutdown);

    let (server_shutdown, server_shutdown_rx) = broadcast::channel(1);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(downstream::serve(listener, app_state.clone(), server_shutdown_rx));

    TestServer {
        addr,
        connector,
        app_state,
        server_shutdown,
    }
}

fn parameters() -> Message {
    let body = json!({
        "latitude": LAT,
        "longitude": LON,
        "radiusMeters": 10000,
        "pollIntervalSeconds": 1
    });
    Message::Text(body.to_string().into())
}

async fn http_get(addr: SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n", path, addr);
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

#[tokio::test]
async fn test_nearby_flight_streamed_once_then_server_stops() {
    let server = start_server().await;

    let mut request = format!("ws://{}/flights", server.addr).into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Authorization", format!("Bearer {}", VALID_TOKEN).parse().unwrap());
    let (mut ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();

    ws.send(parameters()).await.unwrap();

    let received = timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("no flight within 5s")
        .unwrap()
        .unwrap();
    let text = match received {
        Message::Text(text) => text,
        other => panic!("expected a text frame, got {:?}", other),
    };
    let flight: FlightMessage = serde_json::from_str(text.as_str()).unwrap();
    assert_eq!(flight.icao_identity, "123456");
    assert_eq!(flight.call_sign, "test-flight");
    assert_eq!(flight.country_code, "BR");

    // Later ticks find the same flight and stay quiet.
    assert!(timeout(Duration::from_millis(2_500), ws.next()).await.is_err());
    assert!(server.connector.queries() >= 2);

    server.app_state.shutdown();

    let closing = timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("no close frame within 5s")
        .unwrap()
        .unwrap();
    match closing {
        Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 1001),
        other => panic!("expected a close frame, got {:?}", other),
    }

    timeout(Duration::from_secs(5), server.app_state.sessions.wait())
        .await
        .unwrap();
    assert_eq!(server.connector.acquired(), 1);
    assert_eq!(server.connector.released(), 1);

    server.server_shutdown.send(()).ok();
}

#[tokio::test]
async fn test_access_token_query_parameter() {
    let server = start_server().await;

    let url = format!("ws://{}/flights?access_token={}", server.addr, VALID_TOKEN);
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws.send(parameters()).await.unwrap();

    let received = timeout(Duration::from_secs(5), ws.next()).await.unwrap();
    assert!(matches!(received, Some(Ok(Message::Text(_)))));

    // Client leaves: the session ends and the source is released.
    ws.close(None).await.unwrap();
    timeout(Duration::from_secs(5), async {
        while server.connector.released() == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    server.server_shutdown.send(()).ok();
}

#[tokio::test]
async fn test_unauthorized_rejected_before_upgrade() {
    let server = start_server().await;

    let mut request = format!("ws://{}/flights", server.addr).into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Authorization", "Bearer revoked-token".parse().unwrap());
    match tokio_tungstenite::connect_async(request).await {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 401),
        other => panic!("expected HTTP 401, got {:?}", other.map(|(_, r)| r.status())),
    }

    let anonymous = format!("ws://{}/flights", server.addr);
    match tokio_tungstenite::connect_async(anonymous).await {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 401),
        other => panic!("expected HTTP 401, got {:?}", other.map(|(_, r)| r.status())),
    }

    assert_eq!(server.connector.acquired(), 0);
    server.server_shutdown.send(()).ok();
}

#[tokio::test]
async fn test_health_follows_shutdown() {
    let server = start_server().await;

    let response = http_get(server.addr, "/health").await;
    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert!(response.ends_with("SERVING"));

    server.app_state.shutdown();

    let response = http_get(server.addr, "/health").await;
    assert!(response.starts_with("HTTP/1.1 503"), "{}", response);
    assert!(response.ends_with("NOT_SERVING"));

    server.server_shutdown.send(()).ok();
}
