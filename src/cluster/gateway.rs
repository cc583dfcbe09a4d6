use super::CallContext;
use crate::core::{Point, RemoteError, RequestContext, SqlQueryRequest, SqlQueryResponse, WriteResponse};
use async_trait::async_trait;

/// Performs query and write calls against one specific endpoint.
///
/// Failures that mean "this endpoint no longer owns the table" should be reported
/// as `RemoteError::Server` with `status::INVALID_ROUTE`, unreachable peers as
/// `RemoteError::connection(..)`.
#[async_trait]
pub trait RemoteCallGateway: Send + Sync {
    async fn query(
        &self,
        ctx: &CallContext,
        endpoint: &str,
        req: &SqlQueryRequest,
    ) -> std::result::Result<SqlQueryResponse, RemoteError>;

    async fn write(
        &self,
        ctx: &CallContext,
        endpoint: &str,
        req_ctx: &RequestContext,
        points: &[Point],
    ) -> std::result::Result<WriteResponse, RemoteError>;
}
