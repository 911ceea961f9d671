#![allow(dead_code)]

use async_trait::async_trait;
use databridge::route::dispatcher::{ActionDispatcher, DispatchError, SinkAction};
use serde_json::Value as JsonValue;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// Dispatcher double that records every sink action and can be scripted to
/// fail a number of attempts per endpoint before succeeding.
#[derive(Clone, Default)]
pub struct RecordingDispatcher {
    inner: Arc<Mutex<DispatchState>>,
}

#[derive(Default)]
struct DispatchState {
    actions: Vec<(SinkAction, JsonValue)>,
    failures_remaining: HashMap<String, u32>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, endpoint: &str, times: u32) {
        self.inner
            .lock()
            .expect("dispatcher state")
            .failures_remaining
            .insert(endpoint.to_string(), times);
    }

    pub fn actions(&self) -> Vec<(SinkAction, JsonValue)> {
        self.inner.lock().expect("dispatcher state").actions.clone()
    }

    pub fn dispatched_to(&self, endpoint: &str) -> usize {
        self.inner
            .lock()
            .expect("dispatcher state")
            .actions
            .iter()
            .filter(|(action, _)| action.endpoint == endpoint)
            .count()
    }
}

#[async_trait]
impl ActionDispatcher for RecordingDispatcher {
    async fn dispatch(
        &self,
        action: &SinkAction,
        payload: &JsonValue,
    ) -> Result<(), DispatchError> {
        let mut state = self.inner.lock().expect("dispatcher state");
        state.actions.push((action.clone(), payload.clone()));
        if let Some(remaining) = state.failures_remaining.get_mut(&action.endpoint) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(DispatchError::Kafka {
                    endpoint: action.endpoint.clone(),
                    reason: "scripted failure".to_string(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(feature = "mqtt")]
pub use mqtt_mock::{MqttLog, ScriptedMqttSubscriber};

#[cfg(feature = "mqtt")]
mod mqtt_mock {
    use super::*;
    use databridge::transport::mqtt::{MqttMessage, MqttSubscriber, MqttSubscriberError};

    /// Feeds a scripted set of publishes to the trigger runtime and records
    /// subscription and ack activity.
    pub struct ScriptedMqttSubscriber {
        queue: VecDeque<MqttMessage>,
        pub log: Arc<Mutex<MqttLog>>,
    }

    #[derive(Default)]
    pub struct MqttLog {
        pub subscriptions: Vec<(String, u8)>,
        pub acked: Vec<Option<u16>>,
    }

    impl ScriptedMqttSubscriber {
        pub fn new(messages: Vec<MqttMessage>, log: Arc<Mutex<MqttLog>>) -> Self {
            Self {
                queue: messages.into(),
                log,
            }
        }
    }

    #[async_trait]
    impl MqttSubscriber for ScriptedMqttSubscriber {
        async fn subscribe(&mut self, topic: &str, qos: u8) -> Result<(), MqttSubscriberError> {
            self.log
                .lock()
                .expect("mqtt log")
                .subscriptions
                .push((topic.to_string(), qos));
            Ok(())
        }

        async fn next_message(&mut self) -> Result<Option<MqttMessage>, MqttSubscriberError> {
            Ok(self.queue.pop_front())
        }

        async fn ack(&mut self, packet_id: Option<u16>) -> Result<(), MqttSubscriberError> {
            self.log.lock().expect("mqtt log").acked.push(packet_id);
            Ok(())
        }
    }
}

#[cfg(feature = "kafka")]
pub use kafka_mock::ScriptedKafkaConsumer;

#[cfg(feature = "kafka")]
mod kafka_mock {
    use super::*;
    use databridge::transport::kafka::{
        KafkaConsumerError, KafkaConsumerStream, KafkaInboundMessage,
    };

    pub struct ScriptedKafkaConsumer {
        queue: VecDeque<KafkaInboundMessage>,
        pub stored_offsets: Arc<Mutex<Vec<(String, i32, i64)>>>,
    }

    impl ScriptedKafkaConsumer {
        pub fn new(
            messages: Vec<KafkaInboundMessage>,
            stored_offsets: Arc<Mutex<Vec<(String, i32, i64)>>>,
        ) -> Self {
            Self {
                queue: messages.into(),
                stored_offsets,
            }
        }
    }

    #[async_trait]
    impl KafkaConsumerStream for ScriptedKafkaConsumer {
        async fn next(&mut self) -> Result<Option<KafkaInboundMessage>, KafkaConsumerError> {
            Ok(self.queue.pop_front())
        }

        async fn store_offset(
            &mut self,
            message: &KafkaInboundMessage,
        ) -> Result<(), KafkaConsumerError> {
            self.stored_offsets.lock().expect("offset log").push((
                message.topic.clone(),
                message.partition,
                message.offset,
            ));
            Ok(())
        }
    }
}

#[cfg(feature = "amqp")]
pub use amqp_mock::{AmqpLog, ScriptedAmqpConsumer};

#[cfg(feature = "amqp")]
mod amqp_mock {
    use super::*;
    use databridge::transport::amqp::{AmqpConsumerError, AmqpConsumerStream, AmqpDelivery};

    pub struct ScriptedAmqpConsumer {
        queue: VecDeque<AmqpDelivery>,
        pub log: Arc<Mutex<AmqpLog>>,
    }

    #[derive(Default)]
    pub struct AmqpLog {
        pub acked: Vec<u64>,
        pub nacked: Vec<(u64, bool)>,
    }

    impl ScriptedAmqpConsumer {
        pub fn new(deliveries: Vec<AmqpDelivery>, log: Arc<Mutex<AmqpLog>>) -> Self {
            Self {
                queue: deliveries.into(),
                log,
            }
        }
    }

    #[async_trait]
    impl AmqpConsumerStream for ScriptedAmqpConsumer {
        async fn next_delivery(&mut self) -> Result<Option<AmqpDelivery>, AmqpConsumerError> {
            Ok(self.queue.pop_front())
        }

        async fn ack(&mut self, delivery_tag: u64) -> Result<(), AmqpConsumerError> {
            self.log.lock().expect("amqp log").acked.push(delivery_tag);
            Ok(())
        }

        async fn nack(
            &mut self,
            delivery_tag: u64,
            requeue: bool,
        ) -> Result<(), AmqpConsumerError> {
            self.log
                .lock()
                .expect("amqp log")
                .nacked
                .push((delivery_tag, requeue));
            Ok(())
        }
    }
}
