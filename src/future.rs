use crate::body::PrerenderBody;
use crate::error::{BoxError, PrerenderError};
use crate::proxy::render_response;
use http::{Request, Response};
use pin_project_lite::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use tower::Service;

pin_project! {
    /// Future for prerender service responses.
    pub struct ResponseFuture<SF, CF, S, ReqBody> {
        #[pin]
        state: State<SF, CF, S, ReqBody>,
    }
}

pin_project! {
    #[project = StateProj]
    enum State<SF, CF, S, ReqBody> {
        // Waiting on the next service.
        Next {
            #[pin]
            future: SF,
        },
        // Waiting on the rendering service.
        Render {
            #[pin]
            future: CF,
            url: String,
            downstream_gzip: bool,
            fallback: Option<(S, Request<ReqBody>)>,
        },
        // The upstream request could not be built.
        Failed {
            error: Option<PrerenderError>,
        },
    }
}

impl<SF, CF, S, ReqBody> ResponseFuture<SF, CF, S, ReqBody> {
    pub(crate) fn next(future: SF) -> Self {
        Self {
            state: State::Next { future },
        }
    }

    pub(crate) fn render(
        future: CF,
        url: String,
        downstream_gzip: bool,
        fallback: Option<(S, Request<ReqBody>)>,
    ) -> Self {
        Self {
            state: State::Render {
                future,
                url,
                downstream_gzip,
                fallback,
            },
        }
    }

    pub(crate) fn failed(error: PrerenderError) -> Self {
        Self {
            state: State::Failed { error: Some(error) },
        }
    }
}

impl<SF, CF, S, ReqBody, ResBody, UpBody, SE, CE> Future for ResponseFuture<SF, CF, S, ReqBody>
where
    SF: Future<Output = Result<Response<ResBody>, SE>>,
    SE: Into<BoxError>,
    CF: Future<Output = Result<Response<UpBody>, CE>>,
    CE: Into<BoxError>,
    S: Service<Request<ReqBody>, Future = SF>,
{
    type Output = Result<Response<PrerenderBody<ResBody, UpBody>>, BoxError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.project().state;

        loop {
            let (mut inner, req) = match state.as_mut().project() {
                StateProj::Next { future } => {
                    return Poll::Ready(match ready!(future.poll(cx)) {
                        Ok(response) => Ok(response.map(PrerenderBody::next)),
                        Err(e) => Err(e.into()),
                    });
                }
                StateProj::Render {
                    future,
                    url,
                    downstream_gzip,
                    fallback,
                } => match ready!(future.poll(cx)) {
                    Ok(response) => {
                        return Poll::Ready(Ok(render_response(response, *downstream_gzip)));
                    }
                    Err(source) => {
                        let error = PrerenderError::Upstream {
                            url: std::mem::take(url),
                            source: source.into(),
                        };
                        match fallback.take() {
                            Some(fallback) => {
                                tracing::warn!(
                                    url = %error.url(),
                                    error = %error,
                                    "prerender failed, falling back to next service"
                                );
                                fallback
                            }
                            None => return Poll::Ready(Err(error.into())),
                        }
                    }
                },
                StateProj::Failed { error } => {
                    return Poll::Ready(Err(match error.take() {
                        Some(error) => error.into(),
                        None => "prerender future polled after completion".into(),
                    }));
                }
            };

            state.set(State::Next {
                future: inner.call(req),
            });
        }
    }
}
