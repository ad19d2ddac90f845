use std::sync::atomic::{AtomicU32, Ordering};
use testcontainers::ContainerAsync;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::redis::Redis;
use tokio::sync::OnceCell;

static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

pub fn unique_id(prefix: &str) -> String {
    let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("{}-{}", prefix, id)
}

/// Key unique to this process run, so tests sharing one Redis never collide.
pub fn unique_key(prefix: &str) -> String {
    format!("{}:{}", unique_id(prefix), std::process::id())
}

pub struct RedisFixture {
    #[allow(dead_code)]
    container: ContainerAsync<Redis>,
    url: String
}

impl RedisFixture {
    pub fn url(&self) -> &str {
        &self.url
    }
}

static REDIS: OnceCell<Option<RedisFixture>> = OnceCell::const_new();

pub async fn redis() -> Option<&'static RedisFixture> {
    REDIS
        .get_or_init(|| async {
            match Redis::default().start().await {
                Ok(container) => {
                    let port = match container.get_host_port_ipv4(6379).await {
                        Ok(p) => p,
                        Err(e) => {
                            tracing::warn!("Failed to get Redis port: {:?}", e);
                            return None;
                        }
                    };
                    let url = format!("redis://localhost:{}", port);

                    if let Err(e) = verify_redis_connection(&url).await {
                        tracing::warn!("Redis connection verification failed: {:?}", e);
                        return None;
                    }

                    tracing::info!("Redis fixture started on port {}", port);
                    Some(RedisFixture { container, url })
                }
                Err(e) => {
                    tracing::warn!("Failed to start Redis container: {:?}", e);
                    None
                }
            }
        })
        .await
        .as_ref()
}

async fn verify_redis_connection(url: &str) -> Result<(), Box<dyn std::error::Error>> {
    let client = redis::Client::open(url)?;
    let mut conn = client.get_multiplexed_async_connection().await?;
    let _: String = redis::cmd("PING").query_async(&mut conn).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unique_id_generation() {
        let id1 = unique_id("test");
        let id2 = unique_id("test");
        assert_ne!(id1, id2);
        assert!(id1.starts_with("test-"));
        assert!(id2.starts_with("test-"));
    }

    #[test]
    fn test_unique_key_contains_prefix() {
        let key = unique_key("rate");
        assert!(key.starts_with("rate-"));
        assert!(key.contains(':'));
    }
}
