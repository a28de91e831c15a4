use crate::codec::{self, Transcode};
use crate::error::BoxError;
use bytes::{Buf, Bytes, BytesMut};
use compression_codecs::{DecodeV2, EncodeV2};
use compression_core::util::{PartialBuffer, WriteBuffer};
use http_body::{Body, Frame};
use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

const OUTPUT_BUFFER_SIZE: usize = 8 * 1024; // 8KB output buffer

pin_project! {
    /// Response body of a [`PrerenderService`](crate::PrerenderService).
    ///
    /// Either the next service's body, or the rendering service's body passed
    /// through, gzipped or gunzipped to match what the client accepts.
    #[project = PrerenderBodyProj]
    #[allow(missing_docs)]
    pub enum PrerenderBody<B, R> {
        /// Body produced by the next service.
        Next {
            #[pin]
            inner: B,
        },
        /// Rendered body copied verbatim.
        Rendered {
            #[pin]
            inner: R,
        },
        /// Rendered body run through a gzip encoder or decoder.
        Transcoded {
            #[pin]
            inner: R,
            state: TranscodedBody,
        },
    }
}

/// The gzip stream applied to a transcoded body.
enum Coder {
    Encode(Box<dyn EncodeV2 + Send>),
    Decode(Box<dyn DecodeV2 + Send>),
}

/// State and buffers for a body being gzipped or gunzipped.
pub(crate) struct TranscodedBody {
    coder: Coder,
    output_buffer: Vec<u8>,
    state: TranscodeState,
    saw_input: bool,
    pending_trailers: Option<http::HeaderMap>,
}

/// State machine for transcoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TranscodeState {
    /// Reading data from the upstream body and transcoding.
    Reading,
    /// Finishing the stream after the upstream body is done.
    Finishing,
    /// Emitting buffered trailers.
    Trailers,
    /// Transcoding is complete.
    Done,
}

impl TranscodedBody {
    fn new(coder: Coder) -> Self {
        Self {
            coder,
            output_buffer: vec![0u8; OUTPUT_BUFFER_SIZE],
            state: TranscodeState::Reading,
            saw_input: false,
            pending_trailers: None,
        }
    }

    /// Returns the current transcoding state.
    pub(crate) fn state(&self) -> TranscodeState {
        self.state
    }

    /// Returns whether this body compresses rather than decompresses.
    #[allow(dead_code)]
    pub(crate) fn is_compressing(&self) -> bool {
        matches!(self.coder, Coder::Encode(_))
    }

    fn after_finish(&self) -> TranscodeState {
        if self.pending_trailers.is_some() {
            TranscodeState::Trailers
        } else {
            TranscodeState::Done
        }
    }

    /// Polls the upstream body and transcodes data.
    fn poll_transcoded<R>(
        &mut self,
        cx: &mut Context<'_>,
        mut inner: Pin<&mut R>,
    ) -> Poll<Option<Result<Frame<Bytes>, io::Error>>>
    where
        R: Body,
        R::Error: Into<BoxError>,
    {
        loop {
            match self.state {
                TranscodeState::Done => return Poll::Ready(None),

                TranscodeState::Trailers => {
                    self.state = TranscodeState::Done;
                    if let Some(trailers) = self.pending_trailers.take() {
                        return Poll::Ready(Some(Ok(Frame::trailers(trailers))));
                    }
                    return Poll::Ready(None);
                }

                TranscodeState::Finishing => {
                    let data = match self.finish() {
                        Ok(data) => data,
                        Err(e) => return Poll::Ready(Some(Err(self.fail(e)))),
                    };
                    self.state = self.after_finish();
                    if !data.is_empty() {
                        return Poll::Ready(Some(Ok(Frame::data(data))));
                    }
                }

                TranscodeState::Reading => match inner.as_mut().poll_frame(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(None) => {
                        // Upstream body is done, transition to finishing
                        self.state = TranscodeState::Finishing;
                    }
                    Poll::Ready(Some(Err(e))) => {
                        return Poll::Ready(Some(Err(self.fail(io::Error::other(e.into())))));
                    }
                    Poll::Ready(Some(Ok(frame))) => match frame.into_data() {
                        Ok(mut data) => {
                            let input = data.copy_to_bytes(data.remaining());
                            if input.is_empty() {
                                continue;
                            }
                            self.saw_input = true;
                            match self.transcode_chunk(&input) {
                                Ok(output) if output.is_empty() => continue,
                                Ok(output) => return Poll::Ready(Some(Ok(Frame::data(output)))),
                                Err(e) => return Poll::Ready(Some(Err(self.fail(e)))),
                            }
                        }
                        Err(frame) => {
                            if let Ok(trailers) = frame.into_trailers() {
                                // Buffer trailers and finish the stream first
                                self.pending_trailers = Some(trailers);
                                self.state = TranscodeState::Finishing;
                            }
                        }
                    },
                },
            }
        }
    }

    fn fail(&mut self, error: io::Error) -> io::Error {
        tracing::warn!(error = %error, "prerendered body failed mid-stream");
        self.state = TranscodeState::Done;
        error
    }

    /// Feeds a chunk of upstream data through the coder.
    fn transcode_chunk(&mut self, input: &[u8]) -> io::Result<Bytes> {
        let mut input_buf = PartialBuffer::new(input);
        let mut all_output = BytesMut::new();

        loop {
            let read_before = input_buf.written_len();
            let mut output = WriteBuffer::new_initialized(self.output_buffer.as_mut_slice());

            let stream_end = match &mut self.coder {
                Coder::Encode(encoder) => {
                    encoder.encode(&mut input_buf, &mut output)?;
                    false
                }
                Coder::Decode(decoder) => decoder.decode(&mut input_buf, &mut output)?,
            };

            let full = output.has_no_spare_space();
            let written = output.written_len();
            if written > 0 {
                all_output.extend_from_slice(&self.output_buffer[..written]);
            }

            let consumed = input_buf.unwritten().is_empty();
            if stream_end {
                if consumed {
                    break;
                }
                // Another gzip member follows
                if let Coder::Decode(decoder) = &mut self.coder {
                    decoder.reinit()?;
                }
                continue;
            }

            if consumed && !full {
                break;
            }

            // Safety check to prevent infinite loop
            if written == 0 && input_buf.written_len() == read_before {
                return Err(io::Error::other("gzip stream stalled"));
            }
        }

        Ok(all_output.freeze())
    }

    /// Flushes the coder and ends the stream.
    fn finish(&mut self) -> io::Result<Bytes> {
        let mut all_output = BytesMut::new();

        match &mut self.coder {
            Coder::Encode(encoder) => loop {
                let mut output = WriteBuffer::new_initialized(self.output_buffer.as_mut_slice());
                let done = encoder.finish(&mut output)?;
                let written = output.written_len();
                all_output.extend_from_slice(&self.output_buffer[..written]);
                if done {
                    break;
                }
            },
            // An empty upstream body has nothing to decode
            Coder::Decode(_) if !self.saw_input => {}
            Coder::Decode(decoder) => loop {
                let mut output = WriteBuffer::new_initialized(self.output_buffer.as_mut_slice());
                let flushed = decoder.flush(&mut output)?;
                let written = output.written_len();
                all_output.extend_from_slice(&self.output_buffer[..written]);
                if flushed {
                    let mut output =
                        WriteBuffer::new_initialized(self.output_buffer.as_mut_slice());
                    decoder.finish(&mut output)?;
                    break;
                }
            },
        }

        Ok(all_output.freeze())
    }
}

impl<B, R> PrerenderBody<B, R> {
    /// Wraps the next service's body.
    pub fn next(inner: B) -> Self {
        Self::Next { inner }
    }

    /// Wraps a rendered body with the given transformation.
    pub fn rendered(inner: R, transcode: Transcode) -> Self {
        match transcode {
            Transcode::Passthrough => Self::Rendered { inner },
            Transcode::Compress => Self::Transcoded {
                inner,
                state: TranscodedBody::new(Coder::Encode(codec::gzip_encoder())),
            },
            Transcode::Decompress => Self::Transcoded {
                inner,
                state: TranscodedBody::new(Coder::Decode(codec::gzip_decoder())),
            },
        }
    }
}

impl<B, R> Body for PrerenderBody<B, R>
where
    B: Body,
    B::Error: Into<BoxError>,
    R: Body,
    R::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.project() {
            PrerenderBodyProj::Next { inner } => poll_passthrough(inner, cx),
            PrerenderBodyProj::Rendered { inner } => poll_passthrough(inner, cx),
            PrerenderBodyProj::Transcoded { inner, state } => state.poll_transcoded(cx, inner),
        }
    }

    fn is_end_stream(&self) -> bool {
        match self {
            PrerenderBody::Next { inner } => inner.is_end_stream(),
            PrerenderBody::Rendered { inner } => inner.is_end_stream(),
            PrerenderBody::Transcoded { state, .. } => state.state() == TranscodeState::Done,
        }
    }

    fn size_hint(&self) -> http_body::SizeHint {
        match self {
            PrerenderBody::Next { inner } => inner.size_hint(),
            PrerenderBody::Rendered { inner } => inner.size_hint(),
            // Transcoded size is unknown
            PrerenderBody::Transcoded { .. } => http_body::SizeHint::default(),
        }
    }
}

/// Passes frames through, converting data to `Bytes`.
fn poll_passthrough<B>(
    inner: Pin<&mut B>,
    cx: &mut Context<'_>,
) -> Poll<Option<Result<Frame<Bytes>, io::Error>>>
where
    B: Body,
    B::Error: Into<BoxError>,
{
    match inner.poll_frame(cx) {
        Poll::Pending => Poll::Pending,
        Poll::Ready(None) => Poll::Ready(None),
        Poll::Ready(Some(Ok(frame))) => Poll::Ready(Some(Ok(
            frame.map_data(|mut data| data.copy_to_bytes(data.remaining()))
        ))),
        Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(io::Error::other(e.into())))),
    }
}
