//! `GET /data` websocket: one `DataRequest` per connection, answered in one
//! of three delivery modes.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::AppState;
use crate::{
    alert::report,
    calendar::truncate_to_hour,
    error::TickHubError,
    models::{DataRequest, DataResponse, Quotation},
};

pub async fn data_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_data_socket(socket, state))
}

async fn handle_data_socket(mut socket: WebSocket, state: AppState) {
    let _client = state.status.attach();
    let cancel = state.cancel.child_token();
    debug!(clients = state.status.clients(), "DataProvider client attached");

    if state.pipeline.is_faulted() {
        state.status.mark_unknown();
    }
    if !state.status.accepts_requests() {
        let response = DataResponse::server_error(format!(
            "service is {:?}",
            state.status.state()
        ));
        let _ = send_response(&mut socket, &response).await;
        let _ = socket.send(Message::Close(None)).await;
        return;
    }

    let request = match next_request(&mut socket).await {
        Some(Ok(request)) => request,
        Some(Err(details)) => {
            let _ = send_response(&mut socket, &DataResponse::server_error(details)).await;
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
        None => return,
    };
    debug!(?request, "DataProvider request");

    let response = match request {
        DataRequest::HistoricalData { start_time } => {
            historical_response(&state, start_time, &cancel).await
        }
        DataRequest::BufferedData => buffered_response(&state),
        DataRequest::LiveData => {
            stream_live(socket, &state, cancel).await;
            return;
        }
        DataRequest::StopData => DataResponse::server_error("stop requested"),
    };

    let _ = send_response(&mut socket, &response).await;
    let _ = socket.send(Message::Close(None)).await;
}

/// Read until the first request. `None` when the client leaves first.
async fn next_request(socket: &mut WebSocket) -> Option<Result<DataRequest, String>> {
    while let Some(msg) = socket.recv().await {
        let parsed = match msg {
            Ok(Message::Text(text)) => serde_json::from_str::<DataRequest>(&text),
            Ok(Message::Binary(bytes)) => serde_json::from_slice::<DataRequest>(&bytes),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        };
        return Some(parsed.map_err(|e| format!("bad request: {e}")));
    }
    None
}

fn encode(response: &DataResponse) -> String {
    serde_json::to_string(response).unwrap_or_else(|e| {
        warn!("Failed to serialize data response: {}", e);
        "{}".to_string()
    })
}

async fn send_response(socket: &mut WebSocket, response: &DataResponse) -> Result<(), axum::Error> {
    socket.send(Message::Text(encode(response))).await
}

/// Internal failures stop delivery for the whole service; request problems
/// only fail the current call.
fn failure(state: &AppState, context: &str, err: TickHubError) -> DataResponse {
    if err.is_fatal() {
        report(state.alert.as_ref(), context, &err);
        state.status.mark_unknown();
    } else {
        warn!(error = %err, "{}", context);
    }
    DataResponse::server_error(err.to_string())
}

/// Quotations stored for the hour containing `start_time`. Pending writes are
/// flushed first so they are visible to the read.
pub async fn historical_response(
    state: &AppState,
    start_time: DateTime<Utc>,
    cancel: &CancellationToken,
) -> DataResponse {
    if let Err(e) = state.pipeline.flush().await {
        return failure(state, "flush before historical read failed", e);
    }

    let hour = truncate_to_hour(start_time);
    match state.cache.get_historical_data(hour, hour, cancel).await {
        Ok(buckets) => {
            let quotations: Vec<Quotation> =
                buckets.into_iter().flat_map(|b| b.quotations).collect();
            if quotations.is_empty() {
                DataResponse::no_data(format!("no quotations stored for {hour}"))
            } else {
                DataResponse::ok(&quotations)
            }
        }
        Err(e) => failure(state, "historical read failed", e),
    }
}

/// Quotations not yet handed to the store. The pending queue is left intact.
pub fn buffered_response(state: &AppState) -> DataResponse {
    let buffered = state.pipeline.buffered();
    if buffered.is_empty() {
        DataResponse::no_data("no buffered quotations")
    } else {
        DataResponse::ok(&buffered)
    }
}

enum LiveFrame {
    Push(String),
    /// Send, then close the stream
    Last(String),
    End,
}

fn live_frame(tick: Result<Quotation, RecvError>) -> LiveFrame {
    match tick {
        Ok(quotation) => LiveFrame::Push(encode(&DataResponse::ok(std::slice::from_ref(&quotation)))),
        // A gap in the stream is not recoverable for the client
        Err(RecvError::Lagged(n)) => {
            warn!(dropped = n, "Live subscriber lagged, closing stream");
            LiveFrame::Last(encode(&DataResponse::server_error(format!(
                "live stream lagged, {n} quotations dropped"
            ))))
        }
        Err(RecvError::Closed) => LiveFrame::End,
    }
}

/// Push every new tick to the client until it leaves, sends `StopData`, or
/// the service shuts down.
async fn stream_live(socket: WebSocket, state: &AppState, cancel: CancellationToken) {
    let mut live = state.pipeline.subscribe_live();
    let (mut sender, mut receiver) = socket.split();
    info!(clients = state.status.clients(), "📡 Live subscriber attached");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            tick = live.recv() => match live_frame(tick) {
                LiveFrame::Push(msg) => {
                    if sender.send(Message::Text(msg)).await.is_err() {
                        break;
                    }
                }
                LiveFrame::Last(msg) => {
                    let _ = sender.send(Message::Text(msg)).await;
                    break;
                }
                LiveFrame::End => break,
            },
            inbound = receiver.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    if matches!(serde_json::from_str::<DataRequest>(&text), Ok(DataRequest::StopData)) {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    let _ = sender.send(Message::Close(None)).await;
    info!("📡 Live subscriber detached");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::{InitRequest, ResponseStatus, TickRequest},
        server::{routes::router, testing::harness, ServiceState},
    };
    use chrono::Duration;
    use std::time::Duration as StdDuration;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::{
        connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
    };

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn spawn_server(state: AppState) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        format!("ws://{addr}/data")
    }

    async fn request(client: &mut Client, request: &DataRequest) {
        let text = serde_json::to_string(request).unwrap();
        client.send(WsMessage::Text(text)).await.unwrap();
    }

    /// Next response frame, or `None` once the server closes.
    async fn next_response(client: &mut Client) -> Option<DataResponse> {
        let read = async {
            while let Some(msg) = client.next().await {
                match msg.ok()? {
                    WsMessage::Text(text) => return serde_json::from_str(&text).ok(),
                    WsMessage::Close(_) => return None,
                    _ => continue,
                }
            }
            None
        };
        tokio::time::timeout(StdDuration::from_secs(5), read)
            .await
            .expect("no frame from server")
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(StdDuration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(StdDuration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn connect(state: &AppState, symbol: &str, at: &str) {
        state
            .pipeline
            .init(InitRequest {
                id: 0,
                symbol: symbol.into(),
                datetime: at.into(),
                ask: 1.2,
                bid: 1.1,
                origin: "test".into(),
            })
            .await
            .unwrap();
    }

    fn push(state: &AppState, symbol: &str, ticks: i64, start: DateTime<Utc>) {
        for i in 0..ticks {
            state
                .pipeline
                .tick(TickRequest {
                    id: i,
                    symbol: symbol.into(),
                    datetime: (start + Duration::seconds(i)).to_rfc3339(),
                    ask: 1.2,
                    bid: 1.1,
                })
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_empty_hour_is_no_data() {
        let h = harness();
        let cancel = CancellationToken::new();

        let response =
            historical_response(&h.state, "2024-03-05T10:15:00Z".parse().unwrap(), &cancel).await;
        assert_eq!(response.status, ResponseStatus::NoData);
        assert!(response.quotations.is_empty());
        assert_eq!(h.state.status.state(), ServiceState::Starting);
    }

    #[tokio::test]
    async fn test_historical_flushes_pending_first() {
        let h = harness();
        let start: DateTime<Utc> = "2024-03-05T10:00:00Z".parse().unwrap();
        connect(&h.state, "EURUSD", "2024-03-05T09:59:59Z").await;
        push(&h.state, "EURUSD", 5, start);

        let pipeline = h.state.pipeline.clone();
        tokio::time::timeout(std::time::Duration::from_secs(5), async move {
            while pipeline.pending_len() < 5 {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let response =
            historical_response(&h.state, start + Duration::minutes(30), &CancellationToken::new())
                .await;
        assert_eq!(response.status, ResponseStatus::Ok);
        assert_eq!(response.quotations.len(), 5);
        assert_eq!(response.quotations[0].datetime_utc, "2024-03-05T10:00:00.000000Z");
        assert_eq!(response.quotations[4].id, 5);
        assert_eq!(h.state.pipeline.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_buffered_snapshot_leaves_queue() {
        let h = harness();
        assert_eq!(buffered_response(&h.state).status, ResponseStatus::NoData);

        let start: DateTime<Utc> = "2024-03-05T10:00:00Z".parse().unwrap();
        connect(&h.state, "GBPUSD", "2024-03-05T09:00:00Z").await;
        push(&h.state, "GBPUSD", 3, start);

        let pipeline = h.state.pipeline.clone();
        tokio::time::timeout(std::time::Duration::from_secs(5), async move {
            while pipeline.pending_len() < 3 {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let response = buffered_response(&h.state);
        assert_eq!(response.status, ResponseStatus::Ok);
        assert_eq!(response.quotations.len(), 3);
        assert!(response.quotations.iter().all(|q| q.symbol == "GBPUSD"));
        assert_eq!(h.state.pipeline.pending_len(), 3);
        // Nothing reached disk
        assert!(h
            .store
            .get_data(start)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_internal_failure_marks_service_unknown() {
        let h = harness();
        h.state.status.mark_activated();

        let response = failure(
            &h.state,
            "historical read failed",
            TickHubError::ConcurrencyViolation("bucket missing".into()),
        );
        assert_eq!(response.status, ResponseStatus::ServerError);
        assert_eq!(h.state.status.state(), ServiceState::Unknown);
        assert_eq!(h.alert.raised(), 1);

        // Request errors do not fault the service
        let h = harness();
        h.state.status.mark_activated();
        failure(&h.state, "bad range", TickHubError::Range("too wide".into()));
        assert_eq!(h.state.status.state(), ServiceState::Activated);
    }

    #[tokio::test]
    async fn test_live_stream_pushes_ticks_until_stop() {
        let h = harness();
        let url = spawn_server(h.state.clone()).await;
        connect(&h.state, "EURUSD", "2024-03-05T09:59:59Z").await;

        let (mut client, _) = connect_async(url.as_str()).await.unwrap();
        request(&mut client, &DataRequest::LiveData).await;
        let pipeline = h.state.pipeline.clone();
        wait_for(move || pipeline.live_subscribers() == 1).await;

        let start: DateTime<Utc> = "2024-03-05T10:00:00Z".parse().unwrap();
        push(&h.state, "EURUSD", 2, start);

        for id in 0..2 {
            let response = next_response(&mut client).await.unwrap();
            assert_eq!(response.status, ResponseStatus::Ok);
            assert_eq!(response.quotations.len(), 1);
            assert_eq!(response.quotations[0].id, id);
        }

        request(&mut client, &DataRequest::StopData).await;
        assert!(next_response(&mut client).await.is_none());
        let status = h.state.status.clone();
        wait_for(move || status.clients() == 0).await;
        assert_eq!(h.state.pipeline.live_subscribers(), 0);
    }

    #[tokio::test]
    async fn test_buffered_request_over_socket() {
        let h = harness();
        let url = spawn_server(h.state.clone()).await;
        connect(&h.state, "GBPUSD", "2024-03-05T09:00:00Z").await;
        push(&h.state, "GBPUSD", 3, "2024-03-05T10:00:00Z".parse().unwrap());
        let pipeline = h.state.pipeline.clone();
        wait_for(move || pipeline.pending_len() == 3).await;

        let (mut client, _) = connect_async(url.as_str()).await.unwrap();
        request(&mut client, &DataRequest::BufferedData).await;
        let response = next_response(&mut client).await.unwrap();
        assert_eq!(response.status, ResponseStatus::Ok);
        assert_eq!(response.quotations.len(), 3);
        // One request per connection
        assert!(next_response(&mut client).await.is_none());
    }

    #[tokio::test]
    async fn test_stop_or_garbage_as_first_request_is_server_error() {
        let h = harness();
        let url = spawn_server(h.state.clone()).await;

        let (mut client, _) = connect_async(url.as_str()).await.unwrap();
        request(&mut client, &DataRequest::StopData).await;
        let response = next_response(&mut client).await.unwrap();
        assert_eq!(response.status, ResponseStatus::ServerError);
        assert_eq!(response.details.as_deref(), Some("stop requested"));
        assert!(next_response(&mut client).await.is_none());

        let (mut client, _) = connect_async(url.as_str()).await.unwrap();
        client
            .send(WsMessage::Text("{\"code\":\"rewind\"}".into()))
            .await
            .unwrap();
        let response = next_response(&mut client).await.unwrap();
        assert_eq!(response.status, ResponseStatus::ServerError);
        assert!(response.details.unwrap().starts_with("bad request"));
        assert_eq!(h.state.status.state(), ServiceState::Starting);
    }

    #[tokio::test]
    async fn test_unknown_service_refuses_new_clients() {
        let h = harness();
        h.state.status.mark_activated();
        h.state.status.mark_unknown();
        let url = spawn_server(h.state.clone()).await;

        let (mut client, _) = connect_async(url.as_str()).await.unwrap();
        let response = next_response(&mut client).await.unwrap();
        assert_eq!(response.status, ResponseStatus::ServerError);
        assert_eq!(response.details.as_deref(), Some("service is Unknown"));
        assert!(next_response(&mut client).await.is_none());
    }

    #[test]
    fn test_lagged_subscriber_gets_error_then_close() {
        let LiveFrame::Last(msg) = live_frame(Err(RecvError::Lagged(17))) else {
            panic!("lag must end the stream");
        };
        let response: DataResponse = serde_json::from_str(&msg).unwrap();
        assert_eq!(response.status, ResponseStatus::ServerError);
        assert_eq!(
            response.details.as_deref(),
            Some("live stream lagged, 17 quotations dropped")
        );
        assert!(matches!(live_frame(Err(RecvError::Closed)), LiveFrame::End));
    }
}
