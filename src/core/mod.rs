pub mod error;
pub mod types;
pub mod value;

pub use error::{ClientError, RemoteError, Result, status};
pub use types::{
    Column, Point, PointBuilder, RESERVED_TAG_NAMES, RequestContext, Route, RouteMap, Row,
    SqlQueryRequest, SqlQueryResponse, WriteRequest, WriteResponse,
};
pub use value::Value;
