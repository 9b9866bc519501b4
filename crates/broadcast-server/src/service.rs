//! The message handler tying listeners to the dispatcher and the repeater
//! scheduler.

use std::sync::Arc;

use intentcast_protocol::constants::{
    DEFAULT_FREQUENCY, FieldType, WS_ERR_CODE_BAD_REQUEST, WS_ERR_CODE_INTERNAL,
    WS_ERR_CODE_NOT_FOUND, WS_ERR_CODE_UNPROCESSABLE,
};
use intentcast_protocol::{IntentionPacket, Message, MessageType};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::connection::{ConnectionId, Sender};
use crate::dispatcher::Dispatcher;
use crate::field::{FieldGenerator, NoopField};
use crate::handler::{Handler, HandlerFuture};
use crate::registry::ConnectionRegistry;
use crate::repeater::{BroadcastId, RepeaterError, RepeaterOptions, RepeaterScheduler, SchedulerConfig};

/// Defaults applied to requests that omit them.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub default_frequency: f64,
    pub default_field_type: FieldType,
    pub scheduler: SchedulerConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            default_frequency: DEFAULT_FREQUENCY,
            default_field_type: FieldType::Torus,
            scheduler: SchedulerConfig::default(),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartRepeaterRequest {
    #[serde(default)]
    intention: String,
    frequency: Option<f64>,
    field_type: Option<String>,
    #[serde(default)]
    options: RepeaterOptions,
}

#[derive(Deserialize)]
struct StopRepeaterRequest {
    id: BroadcastId,
}

/// Handles listener requests: broadcasts, repeater control and pings.
pub struct IntentionService {
    dispatcher: Arc<Dispatcher>,
    repeaters: RepeaterScheduler,
    field: Arc<dyn FieldGenerator>,
    config: ServiceConfig,
}

impl IntentionService {
    pub fn new(registry: Arc<ConnectionRegistry>, config: ServiceConfig) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(registry));
        let repeaters = RepeaterScheduler::new(config.scheduler.clone(), Arc::clone(&dispatcher));
        Self {
            dispatcher,
            repeaters,
            field: Arc::new(NoopField),
            config,
        }
    }

    /// Replaces the field generator used for `geometry` data.
    pub fn with_field_generator(mut self, field: impl FieldGenerator) -> Self {
        self.field = Arc::new(field);
        self
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn repeaters(&self) -> &RepeaterScheduler {
        &self.repeaters
    }

    /// Stops every repeater worker.
    pub async fn shutdown(&self) {
        self.repeaters.shutdown().await;
    }

    /// Validates an inbound broadcast and prepares it for fan-out.
    ///
    /// Returns the error code and reason to send back on rejection.
    fn prepare_broadcast(&self, mut msg: Message) -> Result<Message, (i32, String)> {
        if let Some(encoded) = msg.packet_data.as_deref() {
            if let Err(e) = IntentionPacket::decode_verified(encoded) {
                tracing::warn!(msg_type = ?msg.msg_type, error = %e, "dropping message with invalid packet");
                return Err((WS_ERR_CODE_UNPROCESSABLE, format!("invalid packet: {e}")));
            }
        }

        if msg.data.is_null() {
            msg.data = json!({});
        }
        let Value::Object(data) = &mut msg.data else {
            return Err((WS_ERR_CODE_BAD_REQUEST, "data must be an object".into()));
        };

        let intention = data
            .get("intention")
            .and_then(Value::as_str)
            .map(str::to_owned);

        if msg.msg_type == MessageType::Intention {
            let Some(intention) = intention.as_deref().filter(|i| !i.trim().is_empty()) else {
                return Err((WS_ERR_CODE_BAD_REQUEST, "intention is required".into()));
            };
            match data.get("frequency") {
                None | Some(Value::Null) => {
                    data.insert("frequency".into(), json!(self.config.default_frequency));
                }
                Some(v) => match v.as_f64() {
                    Some(hz) if hz.is_finite() && hz > 0.0 => {}
                    _ => {
                        return Err((
                            WS_ERR_CODE_BAD_REQUEST,
                            format!("frequency must be a positive number, got {v}"),
                        ));
                    }
                },
            }
            match data.get("fieldType") {
                None | Some(Value::Null) => {
                    data.insert("fieldType".into(), json!(self.config.default_field_type));
                }
                Some(Value::String(_)) => {}
                Some(v) => {
                    return Err((
                        WS_ERR_CODE_BAD_REQUEST,
                        format!("fieldType must be a string, got {v}"),
                    ));
                }
            }
            tracing::debug!(intention, "intention broadcast");
        }

        if let Some(intention) = intention {
            let kind = match data.get("fieldType").and_then(Value::as_str) {
                Some(s) => s.parse::<FieldType>().ok(),
                None => Some(self.config.default_field_type),
            };
            let frequency = data
                .get("frequency")
                .and_then(Value::as_f64)
                .unwrap_or(self.config.default_frequency);
            if let Some(kind) = kind {
                let geometry = self.field.generate_field(kind, &intention, frequency);
                if !geometry.is_null() {
                    data.insert("geometry".into(), geometry);
                }
            }
        }

        msg.timestamp = chrono::Utc::now();
        Ok(msg)
    }

    async fn start_repeater(&self, msg: &Message) -> Result<Message, (i32, String)> {
        let req: StartRepeaterRequest = msg
            .parse_data()
            .map_err(|e| (WS_ERR_CODE_BAD_REQUEST, format!("invalid request: {e}")))?;

        let frequency = req.frequency.unwrap_or(self.config.default_frequency);
        let field_type = req
            .field_type
            .unwrap_or_else(|| self.config.default_field_type.to_string());

        let id = self
            .repeaters
            .start(&req.intention, frequency, &field_type, req.options)
            .await
            .map_err(repeater_error)?;

        msg.reply(
            MessageType::RepeaterStarted,
            &json!({
                "id": id,
                "intention": req.intention,
                "frequency": frequency,
                "fieldType": field_type,
                "repetitionRateHz": req.options.repetition_rate_hz,
            }),
        )
        .map_err(|e| (WS_ERR_CODE_INTERNAL, e.to_string()))
    }

    async fn stop_repeater(&self, msg: &Message) -> Result<Message, (i32, String)> {
        let req: StopRepeaterRequest = msg
            .parse_data()
            .map_err(|e| (WS_ERR_CODE_BAD_REQUEST, format!("invalid request: {e}")))?;

        self.repeaters.stop(req.id).await.map_err(repeater_error)?;
        let iterations = self
            .repeaters
            .detail(req.id)
            .await
            .map(|d| d.stats.iterations);

        msg.reply(
            MessageType::RepeaterStopped,
            &json!({ "id": req.id, "iterations": iterations }),
        )
        .map_err(|e| (WS_ERR_CODE_INTERNAL, e.to_string()))
    }
}

fn repeater_error(e: RepeaterError) -> (i32, String) {
    let code = match e {
        RepeaterError::InvalidOptions(_) => WS_ERR_CODE_BAD_REQUEST,
        RepeaterError::NotFound(_) => WS_ERR_CODE_NOT_FOUND,
        RepeaterError::Packet(_) | RepeaterError::ShutDown => WS_ERR_CODE_INTERNAL,
    };
    (code, e.to_string())
}

fn reply_with(sender: &Sender, msg: &Message, result: Result<Message, (i32, String)>) {
    let reply = match result {
        Ok(reply) => reply,
        Err((code, reason)) => {
            tracing::debug!(msg_type = ?msg.msg_type, code, %reason, "request rejected");
            msg.reply_error(code, reason)
        }
    };
    let _ = sender.send_msg(&reply);
}

impl Handler for IntentionService {
    fn on_broadcast(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            match self.prepare_broadcast(msg.clone()) {
                Ok(out) => {
                    self.dispatcher.dispatch(out);
                }
                Err((code, reason)) => {
                    let _ = sender.send_error(&msg, code, &reason);
                }
            }
        })
    }

    fn on_start_repeater(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let result = self.start_repeater(&msg).await;
            reply_with(&sender, &msg, result);
        })
    }

    fn on_stop_repeater(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let result = self.stop_repeater(&msg).await;
            reply_with(&sender, &msg, result);
        })
    }

    fn on_get_repeater_stats(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let stats = self.repeaters.stats().await;
            let result = msg
                .reply(MessageType::RepeaterStats, &stats)
                .map_err(|e| (WS_ERR_CODE_INTERNAL, e.to_string()));
            reply_with(&sender, &msg, result);
        })
    }

    fn on_disconnected(&self, id: ConnectionId) -> HandlerFuture<'_> {
        Box::pin(async move {
            tracing::debug!(
                conn = %id,
                remaining = self.dispatcher.registry().len(),
                "listener removed"
            );
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::dispatch_text;
    use crate::repeater::RepeaterStats;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

    struct Harness {
        service: Arc<IntentionService>,
        requester: Sender,
        requester_rx: mpsc::Receiver<WsMessage>,
        listener_rx: mpsc::Receiver<WsMessage>,
    }

    fn harness_with(config: ServiceConfig) -> Harness {
        let registry = Arc::new(ConnectionRegistry::new());
        let (ltx, listener_rx) = mpsc::channel(64);
        registry.register(ConnectionId::new(), Sender::new(ltx));
        let (rtx, requester_rx) = mpsc::channel(64);

        Harness {
            service: Arc::new(IntentionService::new(registry, config)),
            requester: Sender::new(rtx),
            requester_rx,
            listener_rx,
        }
    }

    fn harness() -> Harness {
        harness_with(ServiceConfig::default())
    }

    impl Harness {
        async fn send(&self, value: Value) {
            dispatch_text(&self.service, &self.requester, &value.to_string()).await;
        }
    }

    fn next(rx: &mut mpsc::Receiver<WsMessage>) -> Option<Message> {
        match rx.try_recv() {
            Ok(WsMessage::Text(text)) => Some(serde_json::from_str(&text).unwrap()),
            _ => None,
        }
    }

    #[tokio::test]
    async fn intention_is_fanned_out_with_packet_and_defaults() {
        let mut h = harness_with(ServiceConfig {
            default_frequency: 432.0,
            default_field_type: FieldType::Merkaba,
            ..ServiceConfig::default()
        });
        h.send(json!({"type": "INTENTION", "data": {"intention": "Peace"}})).await;

        let got = next(&mut h.listener_rx).expect("broadcast delivered");
        assert_eq!(got.msg_type, MessageType::Intention);
        assert_eq!(got.data["frequency"], 432.0);
        assert_eq!(got.data["fieldType"], "merkaba");
        let packet = IntentionPacket::decode_verified(got.packet_data.as_deref().unwrap()).unwrap();
        assert_eq!(packet.payload.intention, "Peace");
        assert_eq!(packet.payload.frequency, 432.0);
        assert!(next(&mut h.requester_rx).is_none());
    }

    #[tokio::test]
    async fn geometry_comes_from_the_field_generator() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (tx, mut rx) = mpsc::channel(8);
        registry.register(ConnectionId::new(), Sender::new(tx));
        let service = Arc::new(
            IntentionService::new(registry, ServiceConfig::default()).with_field_generator(
                |kind: FieldType, intention: &str, hz: f64| {
                    json!({"kind": kind, "points": intention.len(), "hz": hz})
                },
            ),
        );
        let (rtx, _rrx) = mpsc::channel(8);
        let text = json!({
            "type": "SACRED_GEOMETRY",
            "data": {"intention": "Love", "fieldType": "flower_of_life", "frequency": 528.0}
        })
        .to_string();
        dispatch_text(&service, &Sender::new(rtx), &text).await;

        let got = next(&mut rx).unwrap();
        assert_eq!(got.msg_type, MessageType::SacredGeometry);
        assert_eq!(got.data["geometry"]["kind"], "flower_of_life");
        assert_eq!(got.data["geometry"]["points"], 4);
        assert!(got.packet_data.is_none());
    }

    #[tokio::test]
    async fn verified_inbound_packet_is_forwarded_unchanged() {
        let mut h = harness();
        let encoded = IntentionPacket::encode("Peace", 7.83, "torus", "broadcast")
            .unwrap()
            .transport_encode()
            .unwrap();
        h.send(json!({
            "type": "INTENTION",
            "data": {"intention": "Peace"},
            "packetData": encoded,
        }))
        .await;

        let got = next(&mut h.listener_rx).unwrap();
        assert_eq!(got.packet_data.as_deref(), Some(encoded.as_str()));
    }

    #[tokio::test]
    async fn tampered_packet_is_dropped() {
        let mut h = harness();
        let mut packet = IntentionPacket::encode("Peace", 7.83, "torus", "broadcast").unwrap();
        packet.payload.intention = "War".into();
        let encoded = packet.transport_encode().unwrap();

        h.send(json!({
            "id": "req-1",
            "type": "DATA",
            "data": {"note": "tampered"},
            "packetData": encoded,
        }))
        .await;

        assert!(next(&mut h.listener_rx).is_none());
        let reply = next(&mut h.requester_rx).unwrap();
        assert_eq!(reply.id.as_deref(), Some("req-1"));
        assert_eq!(reply.as_error().unwrap().code, WS_ERR_CODE_UNPROCESSABLE);

        h.send(json!({"type": "DATA", "data": {}, "packetData": "%%%"})).await;
        assert!(next(&mut h.listener_rx).is_none());
        assert!(next(&mut h.requester_rx).unwrap().as_error().is_some());
    }

    #[tokio::test]
    async fn blank_intention_is_rejected() {
        let mut h = harness();
        h.send(json!({"type": "INTENTION", "data": {"intention": "  "}})).await;
        assert!(next(&mut h.listener_rx).is_none());
        assert_eq!(
            next(&mut h.requester_rx).unwrap().as_error().unwrap().code,
            WS_ERR_CODE_BAD_REQUEST
        );

        h.send(json!({"type": "DATA", "data": [1, 2, 3]})).await;
        assert_eq!(
            next(&mut h.requester_rx).unwrap().as_error().unwrap().code,
            WS_ERR_CODE_BAD_REQUEST
        );
    }

    #[tokio::test]
    async fn intention_with_bad_frequency_is_rejected() {
        let mut h = harness();
        for frequency in [json!("fast"), json!(-5.0), json!(0), json!(true)] {
            h.send(json!({
                "type": "INTENTION",
                "data": {"intention": "Peace", "frequency": frequency}
            }))
            .await;
            assert!(
                next(&mut h.listener_rx).is_none(),
                "frequency {frequency} reached listeners"
            );
            assert_eq!(
                next(&mut h.requester_rx).unwrap().as_error().unwrap().code,
                WS_ERR_CODE_BAD_REQUEST,
                "frequency {frequency}"
            );
        }

        h.send(json!({
            "type": "INTENTION",
            "data": {"intention": "Peace", "fieldType": 7}
        }))
        .await;
        assert!(next(&mut h.listener_rx).is_none());
        assert!(next(&mut h.requester_rx).unwrap().as_error().is_some());

        h.send(json!({
            "type": "INTENTION",
            "data": {"intention": "Peace", "frequency": 528}
        }))
        .await;
        let got = next(&mut h.listener_rx).unwrap();
        let packet = IntentionPacket::decode_verified(got.packet_data.as_deref().unwrap()).unwrap();
        assert_eq!(packet.payload.frequency, 528.0);
    }

    #[tokio::test(start_paused = true)]
    async fn repeater_lifecycle_over_messages() {
        let mut h = harness();
        h.send(json!({
            "id": "s1",
            "type": "START_REPEATER",
            "data": {
                "intention": "Peace",
                "frequency": 7.83,
                "fieldType": "torus",
                "options": {"repetitionRateHz": 10, "useHashing": true}
            }
        }))
        .await;
        let started = next(&mut h.requester_rx).unwrap();
        assert_eq!(started.msg_type, MessageType::RepeaterStarted);
        assert_eq!(started.id.as_deref(), Some("s1"));
        let id = started.data["id"].as_u64().unwrap();

        tokio::time::sleep(Duration::from_millis(250)).await;

        h.send(json!({"type": "GET_REPEATER_STATS"})).await;
        let stats = next(&mut h.requester_rx).unwrap();
        assert_eq!(stats.msg_type, MessageType::RepeaterStats);
        let stats: RepeaterStats = stats.parse_data().unwrap();
        assert_eq!(stats.active_count, 1);
        assert_eq!(stats.broadcasts[0].id, BroadcastId(id));
        assert_eq!(stats.broadcasts[0].iterations, 3);

        h.send(json!({"type": "STOP_REPEATER", "data": {"id": id}})).await;
        let stopped = next(&mut h.requester_rx).unwrap();
        assert_eq!(stopped.msg_type, MessageType::RepeaterStopped);
        assert_eq!(stopped.data["iterations"], 3);

        let mut cycles = 0;
        while let Some(msg) = next(&mut h.listener_rx) {
            assert_eq!(msg.msg_type, MessageType::Repeater);
            cycles += 1;
        }
        assert_eq!(cycles, 3);

        h.send(json!({"type": "STOP_REPEATER", "data": {"id": 9999}})).await;
        assert_eq!(
            next(&mut h.requester_rx).unwrap().as_error().unwrap().code,
            WS_ERR_CODE_NOT_FOUND
        );
    }

    #[tokio::test(start_paused = true)]
    async fn start_repeater_rejects_bad_options() {
        let mut h = harness();
        h.send(json!({
            "type": "START_REPEATER",
            "data": {"intention": "Peace", "options": {"repetitionRateHz": 0}}
        }))
        .await;
        assert_eq!(
            next(&mut h.requester_rx).unwrap().as_error().unwrap().code,
            WS_ERR_CODE_BAD_REQUEST
        );

        h.send(json!({"type": "START_REPEATER", "data": {"intention": 5}})).await;
        assert_eq!(
            next(&mut h.requester_rx).unwrap().as_error().unwrap().code,
            WS_ERR_CODE_BAD_REQUEST
        );

        h.send(json!({"type": "STOP_REPEATER", "data": {}})).await;
        assert_eq!(
            next(&mut h.requester_rx).unwrap().as_error().unwrap().code,
            WS_ERR_CODE_BAD_REQUEST
        );
        assert!(h.service.repeaters().stats().await.broadcasts.is_empty());
    }

    #[tokio::test]
    async fn ping_gets_pong() {
        let mut h = harness();
        h.send(json!({"id": "p", "type": "PING"})).await;
        let pong = next(&mut h.requester_rx).unwrap();
        assert_eq!(pong.msg_type, MessageType::Pong);
        assert_eq!(pong.id.as_deref(), Some("p"));
        assert!(next(&mut h.listener_rx).is_none());
    }

    #[tokio::test]
    async fn unsupported_types_get_501() {
        let mut h = harness();
        h.send(json!({"type": "SOMETHING_ELSE"})).await;
        h.send(json!({"type": "REPEATER_STATS"})).await;
        for _ in 0..2 {
            let err = next(&mut h.requester_rx).unwrap().as_error().unwrap();
            assert_eq!(err.code, 501);
        }
        assert!(next(&mut h.listener_rx).is_none());
    }

    #[tokio::test]
    async fn malformed_json_is_dropped() {
        let mut h = harness();
        dispatch_text(&h.service, &h.requester, "{not json").await;
        assert!(next(&mut h.requester_rx).is_none());
        assert!(next(&mut h.listener_rx).is_none());
    }
}
