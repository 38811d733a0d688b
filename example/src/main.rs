use async_trait::async_trait;
use guarded_pool::{
    BlockingCache, CacheError, ConnectTarget, Manager, PerpetualCache, Pool, PoolConfig,
    PoolError,
};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug)]
pub struct MemConnection {
    user: String,
    closed: bool,
}

#[derive(Debug)]
pub struct MemManager {}

#[async_trait]
impl Manager for MemManager {
    type Connection = MemConnection;
    type Error = String;

    async fn connect(&self, target: &ConnectTarget) -> Result<Self::Connection, Self::Error> {
        Ok(MemConnection {
            user: target.principal.clone(),
            closed: false,
        })
    }

    fn is_closed(&self, conn: &Self::Connection) -> bool {
        conn.closed
    }

    async fn probe(&self, _conn: &mut Self::Connection, _query: &str) -> Result<(), Self::Error> {
        //probe should run the query on a real backend
        Ok(())
    }

    async fn close(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.closed = true;
        Ok(())
    }
}

#[derive(Debug)]
enum DemoError {
    Pool(PoolError),
    Cache(CacheError),
}

impl From<PoolError> for DemoError {
    fn from(e: PoolError) -> Self {
        DemoError::Pool(e)
    }
}

impl From<CacheError> for DemoError {
    fn from(e: CacheError) -> Self {
        DemoError::Cache(e)
    }
}

#[tokio::main]
async fn main() -> Result<(), DemoError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("guarded_pool=debug".parse().unwrap())
                .add_directive("example=info".parse().unwrap()),
        )
        .init();

    let config = PoolConfig::new("mem://demo", "app", "secret")
        .with_max_active(2)
        .with_max_idle(1)
        .with_ping("SELECT 1", Duration::from_millis(100));
    let p = Pool::new(MemManager {}, config).expect("valid pool config");
    let status = p.state().await;
    info!(%status, "pool ready");

    let cache = BlockingCache::new(PerpetualCache::<String, String>::new("users"))
        .with_timeout(Duration::from_secs(1));
    for _ in 0..2 {
        let user = cache
            .get_or_load(&"user:1".to_string(), || async {
                info!("cache miss, loading through the pool");
                let conn = p.get().await?;
                let user = conn.lock().await?.user.clone();
                p.release(conn).await;
                Ok::<_, DemoError>(user)
            })
            .await?;
        info!(%user, cache_size = cache.size(), "loaded");
    }
    let status = p.state().await;
    info!(%status, "done");
    Ok(())
}
