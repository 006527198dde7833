use crate::{
    compress::{Compressors, FileCache},
    errors::ErrorKind,
    http::{
        cursor::{Parser, Source},
        request::{Request, RequestData},
        response::Response,
        types::StatusCode,
    },
    limits::{ReqLimits, RespLimits},
    router::{Page, Route, UriPart},
    server::send::{self, Plan, SendContext, Upstream},
};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, warn};

/// Everything shared by the connections of one server.
pub(crate) struct Site {
    pub(crate) router: UriPart,
    pub(crate) req_limits: ReqLimits,
    pub(crate) resp_limits: RespLimits,
    pub(crate) compressors: Arc<Compressors>,
    pub(crate) cache: FileCache,
    pub(crate) upstream: Option<Arc<dyn Upstream>>,
    pub(crate) json_errors: bool,
}

/// `root` joined with the unmatched segments, `None` if one would escape it.
fn static_path(root: &Path, rest: &[String]) -> Option<PathBuf> {
    let mut path = root.to_path_buf();
    for segment in rest {
        if segment.is_empty() || segment == "." || segment == ".." || segment.contains(['/', '\\']) {
            return None;
        }
        path.push(segment);
    }
    Some(path)
}

impl Site {
    #[inline]
    fn context(&self) -> SendContext<'_> {
        SendContext {
            limits: &self.resp_limits,
            cache: &self.cache,
            upstream: self.upstream.as_deref(),
        }
    }

    /// Routes, runs and prepares one request whose head is already parsed.
    ///
    /// Only transport failures come back as `Err`; everything else is
    /// turned into an error page or a bare error response.
    pub(crate) async fn serve(
        &self,
        mut data: RequestData,
        parser: &mut Parser,
        source: &mut dyn Source,
    ) -> Result<Plan, ErrorKind> {
        let page = self.router.get_handler(&mut data);

        let mut resp = Response::new(&self.resp_limits, self.compressors.clone());
        resp.bind_request(&data);

        let missing_length = data.has_body && data.body_size.is_none();
        let req_mask = page.route.as_ref().and_then(|route| route.req_mask.clone());
        let mut req = Request::new(data, parser, source, &self.req_limits, req_mask);

        let outcome = match missing_length {
            true => {
                resp.close();
                Err(ErrorKind::BodyMissingLength)
            }
            false => self.run_page(&page, &mut req, &mut resp).await,
        };
        if let Err(err) = outcome {
            if err.is_transport() {
                return Err(err);
            }
            self.error_page(&page, &mut req, &mut resp, err).await?;
        }

        req.drain().await?;

        let ctx = self.context();
        match send::prepare(&mut resp, &ctx).await {
            Ok(plan) => Ok(plan),
            Err(err) if err.is_transport() => Err(err),
            Err(err) => {
                self.error_page(&page, &mut req, &mut resp, err).await?;

                match send::prepare(&mut resp, &ctx).await {
                    Ok(plan) => Ok(plan),
                    Err(err) => {
                        warn!("error page for {} cannot be sent: {err}", req.uri());
                        send::bare_error(&mut resp, &err, self.json_errors);
                        send::prepare(&mut resp, &ctx).await
                    }
                }
            }
        }
    }

    async fn run_layers(
        layers: &[Route],
        req: &mut Request<'_>,
        resp: &mut Response,
    ) -> Result<bool, ErrorKind> {
        for layer in layers {
            layer.handler.call(req, resp).await?;
            if req.is_stopped() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn run_page(
        &self,
        page: &Page,
        req: &mut Request<'_>,
        resp: &mut Response,
    ) -> Result<(), ErrorKind> {
        if !Self::run_layers(&page.layers, req, resp).await? {
            return Ok(());
        }

        if let Some(route) = &page.route {
            resp.set_mask(route.resp_mask.clone());
            return route.handler.call(req, resp).await;
        }

        if let Some((root, depth)) = &page.statics {
            let data = req.data();
            let rest = data.path.get(*depth..data.path_size()).unwrap_or_default();

            if let Some(path) = static_path(root, rest).filter(|path| path.is_file()) {
                resp.serve_static(path);
                return Ok(());
            }
        }

        Err(ErrorKind::with_status(
            StatusCode::NotFound,
            format!("nothing at {}", req.uri()),
        ))
    }

    async fn error_page(
        &self,
        page: &Page,
        req: &mut Request<'_>,
        resp: &mut Response,
        err: ErrorKind,
    ) -> Result<(), ErrorKind> {
        debug!("{} {} failed: {err}", req.method().as_str(), req.uri());

        resp.clear();
        resp.set_mask(None);

        let Some(error) = &page.error else {
            send::bare_error(resp, &err, self.json_errors);
            return Ok(());
        };

        resp.status(err.status());
        req.fail(err);

        let layers = &page.layers[..page.error_layers];
        let outcome = match Self::run_layers(layers, req, resp).await {
            Ok(true) => error.handler.call(req, resp).await,
            other => other.map(|_| ()),
        };

        match outcome {
            Ok(()) => Ok(()),
            Err(failure) if failure.is_transport() => Err(failure),
            Err(failure) => {
                warn!("error page {} failed: {failure}", error.pattern);

                let original = req.error.take();
                send::bare_error(resp, original.as_ref().unwrap_or(&failure), self.json_errors);
                Ok(())
            }
        }
    }
}
