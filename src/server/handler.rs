use crate::{errors::ErrorKind, http::request::Request, http::response::Response};
use std::{future::Future, pin::Pin};

/// Code run for a matched route, a layer or an error page.
///
/// One value is shared by every connection, so `&self` is the place for
/// shared state (a database pool, a cache). Returning `Err` sends the
/// request to the closest `+error` page of the route, or to a bare error
/// response with [`ErrorKind::status`].
///
/// # Examples
///
/// A route handler
/// ```
/// use trellis_web::{Error, Handler, Request, Response, StatusCode};
///
/// struct Hello;
///
/// impl Handler for Hello {
///     async fn handle(&self, req: &mut Request<'_>, resp: &mut Response) -> Result<(), Error> {
///         let name = req.param("name")?.to_string();
///         resp.status(StatusCode::Ok).text(format!("hi {name}"))
///     }
/// }
/// ```
/// An error page, reading the error that brought the request here
/// ```
/// use trellis_web::{Error, Handler, Request, Response, StatusCode};
///
/// struct ErrorPage;
///
/// impl Handler for ErrorPage {
///     async fn handle(&self, req: &mut Request<'_>, resp: &mut Response) -> Result<(), Error> {
///         let status = req.error().map(|e| e.status()).unwrap_or(StatusCode::NotFound);
///         resp.status(status).text(format!("<h1>{}</h1>", status.message()))
///     }
/// }
/// ```
/// A layer that stops the chain
/// ```
/// use trellis_web::{Error, Handler, Request, Response, StatusCode};
///
/// struct Auth;
///
/// impl Handler for Auth {
///     async fn handle(&self, req: &mut Request<'_>, resp: &mut Response) -> Result<(), Error> {
///         if req.header("authorization").is_none() {
///             req.stop_propagation();
///             resp.status(StatusCode::Unauthorized).text("login first")?;
///         }
///         Ok(())
///     }
/// }
/// ```
pub trait Handler: Send + Sync + 'static {
    fn handle(
        &self,
        req: &mut Request<'_>,
        resp: &mut Response,
    ) -> impl Future<Output = Result<(), ErrorKind>> + Send;
}

pub(crate) type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), ErrorKind>> + Send + 'a>>;

/// Object-safe form of [`Handler`], stored in the router.
pub(crate) trait ErasedHandler: Send + Sync {
    fn call<'a, 'c: 'a>(
        &'a self,
        req: &'a mut Request<'c>,
        resp: &'a mut Response,
    ) -> HandlerFuture<'a>;
}

impl<H: Handler> ErasedHandler for H {
    #[inline]
    fn call<'a, 'c: 'a>(
        &'a self,
        req: &'a mut Request<'c>,
        resp: &'a mut Response,
    ) -> HandlerFuture<'a> {
        Box::pin(self.handle(req, resp))
    }
}
