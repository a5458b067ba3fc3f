use crate::config::{NotificationConfig, ScheduleConfig};
use crate::duration::DurationParser;
use crate::manager::SourceManager;
use crate::types::CacheItem;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

/// What gets reported on each notification tick: certs that are already
/// dead, and certs that will die before the next tick comes around.
#[derive(Debug, Clone)]
pub struct Notification {
    pub expired: Vec<CacheItem>,
    pub expiring_soon: Vec<CacheItem>,
    pub doomsday_url: String,
}

impl Notification {
    pub fn is_empty(&self) -> bool {
        self.expired.is_empty() && self.expiring_soon.is_empty()
    }
}

#[async_trait]
pub trait NotifyBackend: Send + Sync {
    async fn send(&self, notification: &Notification) -> crate::Result<()>;
}

pub fn create_notify_backend(
    backend_type: &str,
    properties: &HashMap<String, serde_yaml::Value>,
) -> crate::Result<Box<dyn NotifyBackend>> {
    match backend_type {
        "slack" => Ok(Box::new(SlackBackend::from_config(properties)?)),
        "shout" => Ok(Box::new(ShoutBackend::from_config(properties)?)),
        other => Err(crate::DoomsdayError::config(format!(
            "Unknown notification backend: {}",
            other
        ))),
    }
}

/// When notifications fire: either a fixed interval or a cron expression.
pub enum Schedule {
    Constant { interval: Duration },
    Cron { schedule: cron::Schedule },
}

impl Schedule {
    pub fn from_config(config: &ScheduleConfig) -> crate::Result<Self> {
        match config.schedule_type.as_str() {
            "constant" => {
                let interval = match config.properties.get("interval") {
                    Some(serde_yaml::Value::Number(n)) => {
                        Duration::minutes(n.as_u64().unwrap_or(0) as i64)
                    }
                    Some(serde_yaml::Value::String(s)) => DurationParser::parse(s)?,
                    _ => {
                        return Err(crate::DoomsdayError::config(
                            "constant schedule requires an interval",
                        ))
                    }
                };
                if interval <= Duration::zero() {
                    return Err(crate::DoomsdayError::config(
                        "notification interval must be positive",
                    ));
                }
                Ok(Schedule::Constant { interval })
            }
            "cron" => {
                let expr = config
                    .properties
                    .get("spec")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        crate::DoomsdayError::config("cron schedule requires a spec")
                    })?;
                let schedule = cron::Schedule::from_str(expr).map_err(|e| {
                    crate::DoomsdayError::config(format!("Invalid cron spec: {}", e))
                })?;
                Ok(Schedule::Cron { schedule })
            }
            other => Err(crate::DoomsdayError::config(format!(
                "Unknown notification schedule: {}",
                other
            ))),
        }
    }

    pub fn next_fire(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Schedule::Constant { interval } => after + *interval,
            Schedule::Cron { schedule } => schedule
                .after(&after)
                .next()
                .unwrap_or(after + Duration::days(1)),
        }
    }
}

/// Wakes on schedule, pulls the current cache view, and reports the doomed.
pub struct Notifier {
    manager: Arc<SourceManager>,
    backend: Box<dyn NotifyBackend>,
    schedule: Schedule,
    doomsday_url: String,
}

impl Notifier {
    pub fn from_config(
        config: &NotificationConfig,
        manager: Arc<SourceManager>,
    ) -> crate::Result<Self> {
        Ok(Notifier {
            manager,
            backend: create_notify_backend(
                &config.backend.backend_type,
                &config.backend.properties,
            )?,
            schedule: Schedule::from_config(&config.schedule)?,
            doomsday_url: config.doomsday_url.clone(),
        })
    }

    pub fn spawn(self) {
        tokio::spawn(async move {
            loop {
                let now = Utc::now();
                let next = self.schedule.next_fire(now);
                let sleep_for = (next - now).to_std().unwrap_or(std::time::Duration::ZERO);
                tokio::time::sleep(sleep_for).await;

                if let Err(e) = self.check_and_notify().await {
                    tracing::error!("Could not send notifications: {}", e);
                }
            }
        });
    }

    async fn check_and_notify(&self) -> crate::Result<()> {
        let now = Utc::now();
        // Anything that will die before the next tick gets reported now;
        // waiting for the next tick would be too late.
        let cutoff = self.schedule.next_fire(now).timestamp();
        let items = self.manager.data().await;

        let notification = build_notification(items, now.timestamp(), cutoff, &self.doomsday_url);
        if notification.is_empty() {
            tracing::debug!("No certificates to report on this notification cycle");
            return Ok(());
        }

        tracing::info!(
            "Notifying: {} expired, {} expiring before next check",
            notification.expired.len(),
            notification.expiring_soon.len()
        );
        self.backend.send(&notification).await
    }
}

fn build_notification(
    items: Vec<CacheItem>,
    now: i64,
    cutoff: i64,
    doomsday_url: &str,
) -> Notification {
    let (expired, rest): (Vec<CacheItem>, Vec<CacheItem>) =
        items.into_iter().partition(|item| item.not_after <= now);
    let expiring_soon = rest
        .into_iter()
        .filter(|item| item.not_after <= cutoff)
        .collect();

    Notification {
        expired,
        expiring_soon,
        doomsday_url: doomsday_url.to_string(),
    }
}

pub struct SlackBackend {
    webhook_url: String,
    client: reqwest::Client,
}

impl SlackBackend {
    pub fn from_config(properties: &HashMap<String, serde_yaml::Value>) -> crate::Result<Self> {
        let webhook_url = properties
            .get("webhook")
            .or_else(|| properties.get("webhook_url"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| crate::DoomsdayError::config("Slack webhook is required"))?;

        Ok(SlackBackend {
            webhook_url: webhook_url.to_string(),
            client: reqwest::Client::new(),
        })
    }
}

#[async_trait]
impl NotifyBackend for SlackBackend {
    async fn send(&self, notification: &Notification) -> crate::Result<()> {
        let mut attachments = Vec::new();

        if !notification.expired.is_empty() {
            attachments.push(json!({
                "color": "#f44336",
                "title": format!("{} certificate(s) have expired", notification.expired.len()),
                "text": summarize(&notification.expired),
            }));
        }

        if !notification.expiring_soon.is_empty() {
            attachments.push(json!({
                "color": "#ff9800",
                "title": format!(
                    "{} certificate(s) will expire before the next check",
                    notification.expiring_soon.len()
                ),
                "text": summarize(&notification.expiring_soon),
            }));
        }

        let payload = json!({
            "text": format!("Doomsday report: {}", notification.doomsday_url),
            "attachments": attachments,
        });

        let response = self
            .client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(crate::DoomsdayError::backend(format!(
                "Slack webhook returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

fn summarize(items: &[CacheItem]) -> String {
    items
        .iter()
        .map(|item| {
            let remaining = item.not_after - Utc::now().timestamp();
            if remaining <= 0 {
                format!("{} (expired)", item.common_name)
            } else {
                format!(
                    "{} (expires in {})",
                    item.common_name,
                    DurationParser::format(Duration::seconds(remaining))
                )
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub struct ShoutBackend {
    url: String,
    topic: String,
    username: Option<String>,
    password: Option<String>,
    client: reqwest::Client,
}

impl ShoutBackend {
    pub fn from_config(properties: &HashMap<String, serde_yaml::Value>) -> crate::Result<Self> {
        let get_str = |key: &str| -> Option<String> {
            properties
                .get(key)
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };

        Ok(ShoutBackend {
            url: get_str("url")
                .ok_or_else(|| crate::DoomsdayError::config("Shout URL is required"))?
                .trim_end_matches('/')
                .to_string(),
            topic: get_str("topic").unwrap_or_else(|| "doomsday".to_string()),
            username: get_str("username"),
            password: get_str("password"),
            client: reqwest::Client::new(),
        })
    }
}

#[async_trait]
impl NotifyBackend for ShoutBackend {
    async fn send(&self, notification: &Notification) -> crate::Result<()> {
        let doomed = notification.expired.len() + notification.expiring_soon.len();
        let payload = json!({
            "topic": self.topic,
            "message": format!("{} certificate(s) are expired or expiring soon", doomed),
            "link": notification.doomsday_url,
            "ok": false,
        });

        let mut request = self.client.post(format!("{}/events", self.url)).json(&payload);
        if let Some(username) = &self.username {
            request = request.basic_auth(username, self.password.as_deref());
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(crate::DoomsdayError::backend(format!(
                "Shout returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(cn: &str, not_after: i64) -> CacheItem {
        CacheItem {
            common_name: cn.to_string(),
            not_after,
            not_before: 0,
            paths: vec![],
        }
    }

    #[test]
    fn test_build_notification_buckets() {
        let now = 1_000_000;
        let cutoff = now + 3600;
        let items = vec![
            item("dead", now - 10),
            item("dying", now + 60),
            item("fine", cutoff + 60),
        ];

        let notification = build_notification(items, now, cutoff, "https://dd.example.com");
        assert_eq!(notification.expired.len(), 1);
        assert_eq!(notification.expired[0].common_name, "dead");
        assert_eq!(notification.expiring_soon.len(), 1);
        assert_eq!(notification.expiring_soon[0].common_name, "dying");
    }

    #[test]
    fn test_constant_schedule() {
        let config: ScheduleConfig =
            serde_yaml::from_str("type: constant\nproperties:\n  interval: 15\n").unwrap();
        let schedule = Schedule::from_config(&config).unwrap();

        let now = Utc::now();
        assert_eq!(schedule.next_fire(now), now + Duration::minutes(15));
    }

    #[test]
    fn test_constant_schedule_duration_string() {
        let config: ScheduleConfig =
            serde_yaml::from_str("type: constant\nproperties:\n  interval: 12h\n").unwrap();
        let schedule = Schedule::from_config(&config).unwrap();

        let now = Utc::now();
        assert_eq!(schedule.next_fire(now), now + Duration::hours(12));
    }

    #[test]
    fn test_cron_schedule_parses() {
        let config: ScheduleConfig =
            serde_yaml::from_str("type: cron\nproperties:\n  spec: \"0 0 9 * * Mon-Fri *\"\n")
                .unwrap();
        let schedule = Schedule::from_config(&config).unwrap();

        let next = schedule.next_fire(Utc::now());
        assert!(next > Utc::now());
    }

    #[test]
    fn test_rejects_missing_interval() {
        let config: ScheduleConfig = serde_yaml::from_str("type: constant\n").unwrap();
        assert!(Schedule::from_config(&config).is_err());
    }
}
