use crate::amqp::configuration::RabbitMqSettings;
use anyhow::Context;
use lapin::{
    tcp::{AMQPUriTcpExt, NativeTlsConnector},
    types::LongString,
    uri::{AMQPScheme, AMQPUri},
    ConnectionProperties,
};
use std::sync::Arc;
use tokio::time::timeout;
use tracing::warn;

#[derive(Clone)]
/// Opens connections to a RabbitMq broker.
///
/// Consumers get their channel through the [`ChannelFactory`] implementation of
/// `ConnectionFactory`, which dedicates a connection to each channel.
///
/// [`ChannelFactory`]: crate::amqp::ChannelFactory
pub struct ConnectionFactory {
    uri: AMQPUri,
    connection_timeout: std::time::Duration,
    connection_name: Option<String>,
    /// Plain text connections if `None`.
    tls: Option<Arc<Tls>>,
}

#[derive(Clone)]
struct Tls {
    connector: NativeTlsConnector,
    domain_name: String,
}

impl ConnectionFactory {
    /// Build a connection factory from settings.
    ///
    /// The TLS connector is assembled eagerly: a broken CA chain fails here rather than on the
    /// first connection attempt.
    pub fn new_from_config(settings: &RabbitMqSettings) -> Result<Self, anyhow::Error> {
        let tls = settings
            .tls
            .as_ref()
            .map::<Result<Tls, anyhow::Error>, _>(|tls_settings| {
                let domain_name = tls_settings
                    .domain
                    .clone()
                    .unwrap_or_else(|| settings.amqp_uri().authority.host);

                let mut connector_builder = NativeTlsConnector::builder();
                if let Some(certificate) = tls_settings.ca_certificate_chain()? {
                    connector_builder.add_root_certificate(certificate);
                }
                let connector = connector_builder
                    .build()
                    .context("Failed to build the TLS connector for RabbitMQ.")?;

                Ok(Tls {
                    connector,
                    domain_name,
                })
            })
            .transpose()?;
        Ok(Self {
            uri: settings.amqp_uri(),
            connection_timeout: settings.connection_timeout(),
            connection_name: settings.connection_name.clone(),
            tls: tls.map(Arc::new),
        })
    }

    /// Replace the TLS connector, expecting the broker host as certificate domain.
    pub fn set_tls_connector(&mut self, connector: NativeTlsConnector) {
        self.set_tls_connector_with_domain(connector, self.uri.authority.host.clone());
    }

    pub fn set_tls_connector_with_domain(
        &mut self,
        connector: NativeTlsConnector,
        domain_name: String,
    ) {
        self.tls = Some(Arc::new(Tls {
            connector,
            domain_name,
        }));
    }

    /// Open a new connection, encrypted if TLS was configured.
    #[tracing::instrument(name = "rabbitmq_connect", skip(self))]
    pub async fn new_connection(&self) -> Result<lapin::Connection, anyhow::Error> {
        let mut properties =
            ConnectionProperties::default().with_executor(tokio_executor_trait::Tokio::current());
        if let Some(name) = &self.connection_name {
            properties = properties.with_connection_name(LongString::from(name.clone()));
        }
        let connection = timeout(self.connection_timeout, async {
            match &self.tls {
                None => self.connect_without_tls(properties).await,
                Some(tls) => self.connect_with_tls(properties, Arc::clone(tls)).await,
            }
        })
        .await
        .context("Timed out while connecting to RabbitMQ.")?
        .context("Failed to connect to RabbitMQ.")?;
        connection.on_error(|e| {
            warn!("RabbitMQ broken connection: {:?}", e);
        });
        Ok(connection)
    }

    async fn connect_without_tls(
        &self,
        properties: ConnectionProperties,
    ) -> Result<lapin::Connection, lapin::Error> {
        lapin::Connection::connect_uri(self.uri.clone(), properties).await
    }

    async fn connect_with_tls(
        &self,
        properties: ConnectionProperties,
        tls_configuration: Arc<Tls>,
    ) -> Result<lapin::Connection, lapin::Error> {
        lapin::Connection::connector(
            self.uri.clone(),
            Box::new(move |uri| {
                // Plain TCP first, then the TLS handshake against the configured domain.
                let mut amqp_uri = uri.clone();
                amqp_uri.scheme = AMQPScheme::AMQP;
                amqp_uri.connect().and_then(|tcp| {
                    tcp.into_native_tls(&tls_configuration.connector, &tls_configuration.domain_name)
                })
            }),
            properties,
        )
        .await
    }
}
