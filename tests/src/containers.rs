//! Testcontainer setup for Redis.

use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    ContainerAsync, GenericImage,
};

/// A Redis to run the store and broker against.
pub struct TestRedis {
    #[allow(dead_code)]
    container: Option<ContainerAsync<GenericImage>>,
    pub url: String,
}

impl TestRedis {
    /// Starts a Redis container, or uses `ENRICH_TEST_REDIS_URL` when set.
    pub async fn start() -> Self {
        if let Some(url) = std::env::var("ENRICH_TEST_REDIS_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
        {
            return Self {
                container: None,
                url,
            };
        }

        let container = GenericImage::new("redis", "7-alpine")
            .with_exposed_port(6379.tcp())
            .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"))
            .start()
            .await
            .expect("Failed to start Redis");

        let port = container.get_host_port_ipv4(6379).await.unwrap();
        Self {
            container: Some(container),
            url: format!("redis://127.0.0.1:{}/0", port),
        }
    }

    /// URL of logical database `db`, so tests sharing one Redis stay apart.
    pub fn db_url(&self, db: u8) -> String {
        match self.url.rsplit_once('/') {
            Some((base, _)) if base.contains("://") && !base.ends_with('/') => {
                format!("{}/{}", base, db)
            }
            _ => format!("{}/{}", self.url.trim_end_matches('/'), db),
        }
    }
}
