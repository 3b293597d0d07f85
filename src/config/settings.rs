use serde::Deserialize;

/// Top-level configuration settings for the application.
///
/// Groups the site identity, the realtime stream, the polling queue, local
/// persistence and logging.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub site: SiteSettings,
    pub sse: SseSettings,
    pub queue: QueueSettings,
    pub persistence: PersistenceSettings,
    pub logging: LoggingSettings,
}

/// Identity of the workspace the client belongs to.
#[derive(Debug, Deserialize, Clone)]
pub struct SiteSettings {
    pub site_id: String,
    pub data_center: String,
}

/// Realtime stream endpoint and its retry/heartbeat tuning.
#[derive(Debug, Deserialize, Clone)]
pub struct SseSettings {
    /// Whether the realtime stream may be used at all.
    pub enabled: bool,
    pub endpoint: String,
    pub read_timeout_secs: u64,
    pub default_heartbeat_timeout_ms: u64,
    pub heartbeat_buffer_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

/// Polling queue endpoint used when the stream is unavailable.
#[derive(Debug, Deserialize, Clone)]
pub struct QueueSettings {
    pub endpoint: String,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PersistenceSettings {
    pub path: String,
    pub message_list_ttl_minutes: i64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Every field is optional; missing values are filled from [`Settings::default`].
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub site: Option<PartialSiteSettings>,
    pub sse: Option<PartialSseSettings>,
    pub queue: Option<PartialQueueSettings>,
    pub persistence: Option<PartialPersistenceSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialSiteSettings {
    pub site_id: Option<String>,
    pub data_center: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialSseSettings {
    pub enabled: Option<bool>,
    pub endpoint: Option<String>,
    pub read_timeout_secs: Option<u64>,
    pub default_heartbeat_timeout_ms: Option<u64>,
    pub heartbeat_buffer_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialQueueSettings {
    pub endpoint: Option<String>,
    pub poll_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialPersistenceSettings {
    pub path: Option<String>,
    pub message_list_ttl_minutes: Option<i64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            site: SiteSettings {
                site_id: String::new(),
                data_center: "us".to_string(),
            },
            sse: SseSettings {
                enabled: true,
                endpoint: "https://realtime.cloud.gist.build/api/v3/sse".to_string(),
                read_timeout_secs: 300,
                default_heartbeat_timeout_ms: 30_000,
                heartbeat_buffer_ms: 5_000,
                max_retries: 3,
                retry_delay_ms: 5_000,
            },
            queue: QueueSettings {
                endpoint: "https://consumer.cloud.gist.build".to_string(),
                poll_interval_ms: 600_000,
            },
            persistence: PersistenceSettings {
                path: "inapp_db".to_string(),
                message_list_ttl_minutes: 60,
            },
            logging: LoggingSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl Settings {
    /// Fill every value missing from `partial` with the defaults.
    pub fn merged(partial: PartialSettings) -> Self {
        let default = Settings::default();
        let site = partial.site.unwrap_or_default();
        let sse = partial.sse.unwrap_or_default();
        let queue = partial.queue.unwrap_or_default();
        let persistence = partial.persistence.unwrap_or_default();
        let logging = partial.logging.unwrap_or_default();

        Settings {
            site: SiteSettings {
                site_id: site.site_id.unwrap_or(default.site.site_id),
                data_center: site.data_center.unwrap_or(default.site.data_center),
            },
            sse: SseSettings {
                enabled: sse.enabled.unwrap_or(default.sse.enabled),
                endpoint: sse.endpoint.unwrap_or(default.sse.endpoint),
                read_timeout_secs: sse
                    .read_timeout_secs
                    .unwrap_or(default.sse.read_timeout_secs),
                default_heartbeat_timeout_ms: sse
                    .default_heartbeat_timeout_ms
                    .unwrap_or(default.sse.default_heartbeat_timeout_ms),
                heartbeat_buffer_ms: sse
                    .heartbeat_buffer_ms
                    .unwrap_or(default.sse.heartbeat_buffer_ms),
                max_retries: sse.max_retries.unwrap_or(default.sse.max_retries),
                retry_delay_ms: sse.retry_delay_ms.unwrap_or(default.sse.retry_delay_ms),
            },
            queue: QueueSettings {
                endpoint: queue.endpoint.unwrap_or(default.queue.endpoint),
                poll_interval_ms: queue
                    .poll_interval_ms
                    .unwrap_or(default.queue.poll_interval_ms),
            },
            persistence: PersistenceSettings {
                path: persistence.path.unwrap_or(default.persistence.path),
                message_list_ttl_minutes: persistence
                    .message_list_ttl_minutes
                    .unwrap_or(default.persistence.message_list_ttl_minutes),
            },
            logging: LoggingSettings {
                level: logging.level.unwrap_or(default.logging.level),
            },
        }
    }
}
