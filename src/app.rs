use crate::error::{AppError, TaskError};
use crate::http::environ::Environ;
use crate::http::response::{BodyLength, ChunkStream, Emit, ResponseBody, StartResponse};

/// The application the server calls once per request.
///
/// `call` runs on the request's task and may suspend it through
/// [`Environ::suspend`] or the task context. It must call
/// `start_response` before returning a body.
pub trait Application: Send + Sync + 'static {
    fn call(&self, environ: &mut Environ, start_response: &mut StartResponse) -> Result<ResponseBody, AppError>;
}

impl<F> Application for F
where
    F: Fn(&mut Environ, &mut StartResponse) -> Result<ResponseBody, AppError> + Send + Sync + 'static,
{
    fn call(&self, environ: &mut Environ, start_response: &mut StartResponse) -> Result<ResponseBody, AppError> {
        self(environ, start_response)
    }
}

/// Calls the application and hands its response to the connection.
pub(crate) fn respond(app: &dyn Application, environ: &mut Environ) -> Result<(), AppError> {
    let mut start = StartResponse::new();
    let body = app.call(environ, &mut start)?;

    if start.headers_sent() {
        return match body {
            ResponseBody::Empty => Ok(()),
            ResponseBody::Full(bytes) => send(environ, Emit::Chunk(bytes)).map(drop),
            ResponseBody::Stream(chunks) => send_chunks(environ, chunks),
            ResponseBody::File(_) => Err(AppError::new("file body returned after Environ::write")),
        };
    }

    let emit = match body {
        ResponseBody::File(file) => Emit::File {
            head: start.take_head()?,
            body: file,
        },
        ResponseBody::Empty => Emit::Head {
            head: start.take_head()?,
            first: None,
            length: BodyLength::Known(0),
        },
        ResponseBody::Full(bytes) => Emit::Head {
            head: start.take_head()?,
            length: BodyLength::Known(bytes.len() as u64),
            first: Some(bytes),
        },
        ResponseBody::Stream(mut chunks) => {
            let first = chunks.next().transpose()?;
            let length = match &first {
                None => BodyLength::Known(0),
                Some(chunk) if chunks.size_hint() == (0, Some(0)) => BodyLength::Known(chunk.len() as u64),
                Some(_) => BodyLength::Unknown,
            };
            let head = start.take_head()?;
            if !send(environ, Emit::Head { head, first, length })? {
                return Ok(());
            }
            return send_chunks(environ, chunks);
        }
    };
    send(environ, emit)?;
    Ok(())
}

fn send_chunks(environ: &Environ, chunks: ChunkStream) -> Result<(), AppError> {
    for chunk in chunks {
        let chunk = chunk?;
        if chunk.is_empty() {
            continue;
        }
        if !send(environ, Emit::Chunk(chunk))? {
            break;
        }
    }
    Ok(())
}

/// Returns false once the connection wants no more body.
pub(crate) fn send(environ: &Environ, emit: Emit) -> Result<bool, AppError> {
    match environ.task().emit(emit) {
        Ok(()) => Ok(true),
        Err(TaskError::Cancelled) => Ok(false),
        Err(e) => Err(e.into()),
    }
}
