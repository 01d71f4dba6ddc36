use crate::LOG;

/// Request logging in the spirit of tide's built-in middleware, routed
/// through the process slog drain instead of the `log` facade.
pub struct LogMiddleware;

impl LogMiddleware {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl<State: Clone + Send + Sync + 'static> tide::Middleware<State> for LogMiddleware {
    async fn handle(
        &self,
        req: tide::Request<State>,
        next: tide::Next<'_, State>,
    ) -> tide::Result {
        let method = req.method().to_string();
        let path = req.url().path().to_string();
        let start = std::time::Instant::now();
        let response = next.run(req).await;
        slog::info!(
            LOG, "handled request";
            "method" => method,
            "path" => path,
            "status" => response.status() as u16,
            "duration_ms" => start.elapsed().as_millis() as u64,
        );
        Ok(response)
    }
}
