//! Send confirmation emails to registrants.
//!
//! Mails are rendered by an external service reading CloudEvents from a
//! RabbitMQ queue. Only links and the template name travel on the wire.

use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use lapin::options::{BasicPublishOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::uri::{
    AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo,
};
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, RecoveryConfig,
};
use rand::distributions::{Alphanumeric, DistString};
use rand::rngs::OsRng;
use serde::Serialize;
use url::Url;

use crate::config::Mail;
use crate::error::{Result, ServerError};

const DEFAULT_AMPQ_HOST: &str = "localhost";
const DEFAULT_AMPQ_PORT: u16 = 5672;
const DEFAULT_AMPQ_VHOST: &str = "/";

const CONTENT_ENCODING: &str = "utf8";
const CONTENT_TYPE: &str = "application/cloudevents+json";
const DATA_CONTENT_TYPE: &str = "application/json";
const CLOUDEVENT_VERSION: &str = "1.0";
const ID_LENGTH: usize = 12;

/// Mail templates list.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Template {
    /// Ask registrant to confirm their address.
    WaitlistConfirmation,
}

#[derive(Debug, Serialize)]
struct Cloudevent<'a> {
    specversion: &'static str,
    r#type: &'static str,
    source: &'static str,
    id: String,
    time: String,
    datacontenttype: &'static str,
    data: Content<'a>,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    to: &'a str,
    template: Template,
    confirmation_url: &'a str,
    unsubscribe_url: &'a str,
}

/// Build the confirmation and unsubscribe links for `email`.
pub fn links(site: &str, email: &str, token: &str) -> Result<(Url, Url)> {
    let mut site = Url::parse(site)?;
    if !site.path().ends_with('/') {
        let path = format!("{}/", site.path());
        site.set_path(&path);
    }

    let mut confirmation = site.join("confirm")?;
    confirmation.query_pairs_mut().append_pair("token", token);

    let mut unsubscribe = site.join("unsubscribe")?;
    unsubscribe.query_pairs_mut().append_pair("email", email);

    Ok((confirmation, unsubscribe))
}

/// Mail queue manager.
#[derive(Debug, Clone, Default)]
pub struct MailManager {
    queue: String,
    conn: Option<Arc<Connection>>,
}

impl MailManager {
    /// Create a new [`MailManager`].
    pub async fn new(config: &Mail) -> Result<Self> {
        let addr = Url::parse(&config.address)?;
        let uri = AMQPUri {
            scheme: AMQPScheme::from_str(addr.scheme())
                .map_err(|_| ServerError::InvalidScheme)?,
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: config.username.clone(),
                    password: config.password.clone(),
                },
                host: addr.host_str().unwrap_or(DEFAULT_AMPQ_HOST).into(),
                port: addr.port().unwrap_or(DEFAULT_AMPQ_PORT),
            },
            vhost: config
                .vhost
                .clone()
                .unwrap_or(DEFAULT_AMPQ_VHOST.to_string()),
            query: AMQPQueryString {
                channel_max: config.pool,
                ..Default::default()
            },
        };

        let recovery_config =
            RecoveryConfig::default().auto_recover_connection();
        let conn_config = ConnectionProperties::default()
            .with_connection_name("waitlist_mail_client".into())
            .with_experimental_recovery_config(recovery_config);
        let conn = Connection::connect_uri(uri, conn_config).await?;

        tracing::info!(%addr, queue = config.queue, "rabbitmq connected");

        Ok(Self {
            queue: config.queue.clone(),
            conn: Some(Arc::new(conn)),
        })
    }

    async fn create_channel(
        conn: Arc<Connection>,
        queue: &str,
    ) -> Result<Channel> {
        let channel = conn.create_channel().await?;
        channel
            .queue_declare(
                queue.into(),
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(channel)
    }

    fn create_event(data: Content) -> Cloudevent {
        let id = Alphanumeric.sample_string(&mut OsRng, ID_LENGTH);
        Cloudevent {
            specversion: CLOUDEVENT_VERSION,
            r#type: "com.pymcu.email",
            source: "com.pymcu.waitlist",
            id,
            time: Utc::now().to_rfc3339(),
            datacontenttype: DATA_CONTENT_TYPE,
            data,
        }
    }

    /// Publish the confirmation email for a new registrant.
    ///
    /// Without a configured queue nothing is sent.
    pub async fn send_confirmation(
        &self,
        email: &str,
        confirmation_url: &Url,
        unsubscribe_url: &Url,
    ) -> Result<()> {
        let Some(conn) = &self.conn else {
            tracing::debug!("mail queue not configured, confirmation skipped");
            return Ok(());
        };
        let channel =
            Self::create_channel(Arc::clone(conn), &self.queue).await?;

        let content = Content {
            to: email,
            template: Template::WaitlistConfirmation,
            confirmation_url: confirmation_url.as_str(),
            unsubscribe_url: unsubscribe_url.as_str(),
        };
        let payload = serde_json::to_vec(&Self::create_event(content))?;

        channel
            .basic_publish(
                "".into(),
                self.queue.as_str().into(),
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default()
                    .with_content_encoding(CONTENT_ENCODING.into())
                    .with_content_type(CONTENT_TYPE.into()),
            )
            .await?;

        tracing::trace!(template = ?Template::WaitlistConfirmation, "event sent");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_links() {
        let (confirm, unsubscribe) =
            links("https://pymcu.com", "jane+test@example.com", "abc123").unwrap();

        assert_eq!(confirm.as_str(), "https://pymcu.com/confirm?token=abc123");
        assert_eq!(
            unsubscribe.as_str(),
            "https://pymcu.com/unsubscribe?email=jane%2Btest%40example.com"
        );
    }

    #[test]
    fn test_event_payload() {
        let (confirm, unsubscribe) = links("http://localhost:4321", "a@b.co", "t").unwrap();
        let event = MailManager::create_event(Content {
            to: "a@b.co",
            template: Template::WaitlistConfirmation,
            confirmation_url: confirm.as_str(),
            unsubscribe_url: unsubscribe.as_str(),
        });
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["specversion"], CLOUDEVENT_VERSION);
        assert_eq!(json["id"].as_str().unwrap().len(), ID_LENGTH);
        assert_eq!(json["data"]["template"], "waitlist_confirmation");
        assert_eq!(
            json["data"]["confirmation_url"],
            "http://localhost:4321/confirm?token=t"
        );
    }

    #[tokio::test]
    async fn test_unconfigured_manager_is_noop() {
        let (confirm, unsubscribe) = links("http://localhost:4321", "a@b.co", "t").unwrap();
        assert!(
            MailManager::default()
                .send_confirmation("a@b.co", &confirm, &unsubscribe)
                .await
                .is_ok()
        );
    }
}
