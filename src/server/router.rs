use super::request::Request;
use super::response::Response;

/// The routing collaborator: processes one request into the response sink.
///
/// Invoked exactly once per request on whichever worker runs the job, so it
/// must be shareable across workers. An `Err` becomes a `500` response.
pub trait Router: Send + Sync + 'static {
    fn handle(&self, req: &Request, res: &mut Response) -> anyhow::Result<()>;
}

impl<F> Router for F
where
    F: Fn(&Request, &mut Response) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn handle(&self, req: &Request, res: &mut Response) -> anyhow::Result<()> {
        self(req, res)
    }
}
