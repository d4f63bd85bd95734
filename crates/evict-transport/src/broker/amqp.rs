//! AMQP 0-9-1 backend.

use std::sync::Arc;

use bytes::Bytes;
use evict_proto::EndpointAddress;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use tracing::debug;

use super::{BrokerBinding, BrokerConnector, BrokerPublisher, BrokerSession, Delivery, DeliveryStream};
use crate::error::{TransportError, TransportResult};
use crate::transport::BoxFuture;

/// AMQP delivery mode for messages that survive a broker restart.
const PERSISTENT: u8 = 2;

const DEFAULT_USER: &str = "guest";
const DEFAULT_PASSWORD: &str = "guest";

/// Connects to an AMQP broker such as RabbitMQ.
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    uri: String,
}

impl AmqpConnector {
    /// Creates a connector for `endpoint`.
    ///
    /// Missing credentials default to `guest`/`guest`; a missing virtual host
    /// defaults to `/`.
    #[must_use]
    pub fn new(endpoint: &EndpointAddress) -> Self {
        Self {
            uri: amqp_uri(endpoint),
        }
    }

    /// The connection URI.
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }
}

fn amqp_uri(endpoint: &EndpointAddress) -> String {
    let user = endpoint.user.as_deref().unwrap_or(DEFAULT_USER);
    let password = endpoint.password.as_deref().unwrap_or(DEFAULT_PASSWORD);
    let vhost = endpoint.virtual_host().unwrap_or("/").replace('/', "%2f");
    format!(
        "amqp://{user}:{password}@{}:{}/{vhost}",
        endpoint.host_name(),
        endpoint.port
    )
}

impl BrokerConnector for AmqpConnector {
    fn connect<'a>(&'a self, binding: &'a BrokerBinding) -> BoxFuture<'a, TransportResult<BrokerSession>> {
        Box::pin(async move {
            let connection = Connection::connect(&self.uri, ConnectionProperties::default()).await?;
            let channel = connection.create_channel().await?;

            channel
                .exchange_declare(
                    &binding.exchange,
                    ExchangeKind::Fanout,
                    ExchangeDeclareOptions {
                        durable: true,
                        ..ExchangeDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await?;
            channel
                .basic_qos(binding.prefetch, BasicQosOptions::default())
                .await?;

            let queue = channel
                .queue_declare(
                    "",
                    QueueDeclareOptions {
                        exclusive: true,
                        auto_delete: true,
                        ..QueueDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await?;
            channel
                .queue_bind(
                    queue.name().as_str(),
                    &binding.exchange,
                    &binding.routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;

            let consumer = channel
                .basic_consume(
                    queue.name().as_str(),
                    &format!("evict-{}", binding.routing_key),
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await?;
            debug!(queue = queue.name().as_str(), "amqp consumer started");

            Ok(BrokerSession {
                publisher: Arc::new(AmqpPublisher {
                    connection,
                    channel: channel.clone(),
                    exchange: binding.exchange.clone(),
                    routing_key: binding.routing_key.clone(),
                }),
                deliveries: Box::new(AmqpDeliveries { channel, consumer }),
            })
        })
    }
}

struct AmqpPublisher {
    connection: Connection,
    channel: Channel,
    exchange: String,
    routing_key: String,
}

impl BrokerPublisher for AmqpPublisher {
    fn publish<'a>(&'a self, payload: Bytes) -> BoxFuture<'a, TransportResult<()>> {
        Box::pin(async move {
            self.channel
                .basic_publish(
                    &self.exchange,
                    &self.routing_key,
                    BasicPublishOptions::default(),
                    &payload,
                    BasicProperties::default().with_delivery_mode(PERSISTENT),
                )
                .await
                .map_err(|e| TransportError::CommunicationBroken(e.to_string()))?;
            Ok(())
        })
    }

    fn close<'a>(&'a self) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if let Err(e) = self.connection.close(200, "closing").await {
                debug!(error = %e, "amqp connection already closed");
            }
        })
    }
}

struct AmqpDeliveries {
    channel: Channel,
    consumer: Consumer,
}

impl DeliveryStream for AmqpDeliveries {
    fn next_delivery<'a>(&'a mut self) -> BoxFuture<'a, TransportResult<Option<Delivery>>> {
        Box::pin(async move {
            match self.consumer.next().await {
                None => Ok(None),
                Some(Ok(delivery)) => Ok(Some(Delivery {
                    delivery_tag: delivery.delivery_tag,
                    routing_key: delivery.routing_key.as_str().to_string(),
                    payload: Bytes::from(delivery.data),
                })),
                Some(Err(e)) => Err(e.into()),
            }
        })
    }

    fn ack<'a>(&'a mut self, delivery_tag: u64) -> BoxFuture<'a, TransportResult<()>> {
        Box::pin(async move {
            self.channel
                .basic_ack(delivery_tag, BasicAckOptions::default())
                .await?;
            Ok(())
        })
    }
}
