//! gRPC handler for cache updates.

use std::sync::Arc;

use tonic::{Request, Response, Status};

use specache_core::UpdateService;

use crate::proto::suffix_cache_service_server::SuffixCacheService;
use crate::proto::{UpdateCacheRequest, UpdateCacheResponse};

/// gRPC service wrapping the host's [`UpdateService`].
pub struct CacheServer {
    update: Arc<UpdateService>,
}

impl CacheServer {
    pub fn new(update: Arc<UpdateService>) -> Self {
        Self { update }
    }
}

#[tonic::async_trait]
impl SuffixCacheService for CacheServer {
    async fn update_cache(
        &self,
        request: Request<UpdateCacheRequest>,
    ) -> Result<Response<UpdateCacheResponse>, Status> {
        let req = request.into_inner();
        let update = Arc::clone(&self.update);

        // Tree construction is CPU-bound; keep it off the RPC threads.
        let result = tokio::task::spawn_blocking(move || {
            let prompt = req.prompt.map(|p| p.tokens).unwrap_or_default();
            let responses: Vec<Vec<i32>> =
                req.responses.into_iter().map(|r| r.tokens).collect();
            update.apply(req.prompt_hash, &prompt, &responses)
        })
        .await
        .map_err(|e| Status::internal(format!("update task failed: {e}")))?;

        let success = match result {
            Ok(()) => true,
            Err(err) => {
                // Arena exhaustion and registry pressure are reported to
                // the client as an unsuccessful update, not a transport
                // error; nothing was published.
                tracing::warn!(error = %err, "cache update rejected");
                false
            }
        };
        Ok(Response::new(UpdateCacheResponse { success }))
    }
}
