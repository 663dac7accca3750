// Bundle Worker - QuickJS sandbox running a fetched extension bundle
//
// Each worker owns a dedicated thread with its own runtime and context:
// - Dangerous globals removed before the bundle loads
// - Web-worker style messaging (postMessage, onmessage, addEventListener)
// - self.close() ends the worker from the inside
// - Synchronous __fetch helper backed by ureq
// - terminate() interrupts running script and stops the thread

use super::backend::SpawnError;
use rquickjs::{Context, Ctx, Exception, Function, Object, Runtime};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use tokio::sync::{mpsc, oneshot};

const WORKER_PRELUDE: &str = r#"
(function () {
    // Remove Node.js globals
    delete globalThis.require;
    delete globalThis.process;
    delete globalThis.Buffer;
    delete globalThis.global;
    delete globalThis.__dirname;
    delete globalThis.__filename;

    // Remove eval and the Function constructor global
    delete globalThis.eval;
    delete globalThis.Function;

    const post = globalThis.__post;
    const close = globalThis.__close;
    const log = globalThis.__log;
    delete globalThis.__post;
    delete globalThis.__close;
    delete globalThis.__log;

    const listeners = [];

    globalThis.self = globalThis;
    globalThis.console = {
        log: function (...args) { log(JSON.stringify(args)); },
        info: function (...args) { log(JSON.stringify(args)); },
        warn: function (...args) { log("WARN: " + JSON.stringify(args)); },
        error: function (...args) { log("ERROR: " + JSON.stringify(args)); }
    };
    globalThis.postMessage = function (message) {
        post(JSON.stringify(message === undefined ? null : message));
    };
    globalThis.close = function () { close(); };
    globalThis.addEventListener = function (type, listener) {
        if (type === "message") listeners.push(listener);
    };
    globalThis.removeEventListener = function (type, listener) {
        const i = listeners.indexOf(listener);
        if (type === "message" && i >= 0) listeners.splice(i, 1);
    };
    globalThis.onmessage = null;

    Object.defineProperty(globalThis, "__dispatch", {
        value: function (json) {
            const event = { data: JSON.parse(json) };
            if (typeof globalThis.onmessage === "function") globalThis.onmessage(event);
            for (const listener of listeners.slice()) listener(event);
        },
        enumerable: false
    });
})();
"#;

/// Handle to a running bundle worker. Dropping it terminates the worker.
pub struct Worker {
    inbound: Option<std_mpsc::Sender<Value>>,
    outbound: mpsc::UnboundedReceiver<Value>,
    interrupt: Arc<AtomicBool>,
}

impl Worker {
    /// Start a worker thread and load `code` into it. Resolves once the
    /// bundle finished its top-level evaluation.
    pub async fn spawn(name: &str, code: String) -> Result<Self, SpawnError> {
        let (inbound_tx, inbound_rx) = std_mpsc::channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let interrupt = Arc::new(AtomicBool::new(false));

        let thread_interrupt = interrupt.clone();
        std::thread::Builder::new()
            .name(format!("worker-{}", name))
            .spawn(move || run_worker(code, inbound_rx, outbound_tx, ready_tx, thread_interrupt))
            .map_err(|e| SpawnError::Worker(e.to_string()))?;

        // Stops a bundle that is still loading when this future is dropped
        let mut abandon = InterruptOnDrop(Some(interrupt.clone()));
        let ready = ready_rx.await;
        abandon.disarm();

        match ready {
            Ok(Ok(())) => Ok(Self {
                inbound: Some(inbound_tx),
                outbound: outbound_rx,
                interrupt,
            }),
            Ok(Err(message)) => Err(SpawnError::Worker(message)),
            Err(_) => Err(SpawnError::Worker("worker exited during startup".to_string())),
        }
    }

    /// Deliver a message to the worker's onmessage handlers
    pub fn post_message(&self, message: Value) -> bool {
        match &self.inbound {
            Some(inbound) => inbound.send(message).is_ok(),
            None => false,
        }
    }

    /// Next message posted by the worker, `None` once it stopped
    pub async fn recv(&mut self) -> Option<Value> {
        self.outbound.recv().await
    }

    /// Stop the worker without waiting for it. Safe to call more than once.
    pub fn terminate(&mut self) {
        self.interrupt.store(true, Ordering::SeqCst);
        if self.inbound.take().is_some() {
            log::debug!("Worker terminated");
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.terminate();
    }
}

struct InterruptOnDrop(Option<Arc<AtomicBool>>);

impl InterruptOnDrop {
    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        if let Some(interrupt) = self.0.take() {
            log::debug!("Worker abandoned while loading");
            interrupt.store(true, Ordering::SeqCst);
        }
    }
}

fn run_worker(
    code: String,
    inbound: std_mpsc::Receiver<Value>,
    outbound: mpsc::UnboundedSender<Value>,
    ready: oneshot::Sender<Result<(), String>>,
    interrupt: Arc<AtomicBool>,
) {
    let sandbox = match WorkerSandbox::new(&code, outbound, interrupt.clone()) {
        Ok(sandbox) => sandbox,
        Err(e) => {
            log::warn!("Failed to load worker bundle: {}", e);
            let _ = ready.send(Err(e));
            return;
        }
    };

    if ready.send(Ok(())).is_err() {
        return;
    }

    while !sandbox.is_closed() {
        let Ok(message) = inbound.recv() else {
            break;
        };
        if interrupt.load(Ordering::SeqCst) {
            break;
        }
        if let Err(e) = sandbox.dispatch(&message) {
            log::warn!("Worker message handler failed: {}", e);
        }
    }

    log::debug!("Worker thread exiting");
}

struct WorkerSandbox {
    runtime: Runtime,
    context: Context,
    closed: Arc<AtomicBool>,
    interrupt: Arc<AtomicBool>,
}

impl WorkerSandbox {
    fn new(
        code: &str,
        outbound: mpsc::UnboundedSender<Value>,
        interrupt: Arc<AtomicBool>,
    ) -> Result<Self, String> {
        let runtime = Runtime::new().map_err(|e| e.to_string())?;
        let handler_interrupt = interrupt.clone();
        runtime.set_interrupt_handler(Some(Box::new(move || {
            handler_interrupt.load(Ordering::Relaxed)
        })));
        let context = Context::full(&runtime).map_err(|e| e.to_string())?;
        let closed = Arc::new(AtomicBool::new(false));

        let close_flag = closed.clone();
        context.with(|ctx| {
            install_globals(&ctx, outbound, close_flag)
                .and_then(|_| ctx.eval::<(), _>(WORKER_PRELUDE))
                .and_then(|_| ctx.eval::<(), _>(code))
                .map_err(|e| describe_error(&ctx, e))
        })?;

        let sandbox = Self {
            runtime,
            context,
            closed,
            interrupt,
        };
        sandbox.run_pending_jobs();

        Ok(sandbox)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn dispatch(&self, message: &Value) -> Result<(), String> {
        let json = serde_json::to_string(message).map_err(|e| e.to_string())?;

        self.context.with(|ctx| {
            ctx.globals()
                .get::<_, Function>("__dispatch")
                .and_then(|dispatch| dispatch.call::<_, ()>((json,)))
                .map_err(|e| describe_error(&ctx, e))
        })?;

        self.run_pending_jobs();
        Ok(())
    }

    fn run_pending_jobs(&self) {
        while self.runtime.is_job_pending() && !self.interrupt.load(Ordering::Relaxed) {
            if self.runtime.execute_pending_job().is_err() {
                log::warn!("Worker promise job threw an exception");
            }
        }
    }
}

fn install_globals<'js>(
    ctx: &Ctx<'js>,
    outbound: mpsc::UnboundedSender<Value>,
    closed: Arc<AtomicBool>,
) -> rquickjs::Result<()> {
    let post_fn = Function::new(ctx.clone(), move |json: String| {
        match serde_json::from_str::<Value>(&json) {
            Ok(message) => {
                let _ = outbound.send(message);
            }
            Err(e) => log::warn!("Worker posted a message that is not JSON: {}", e),
        }
    })?;
    ctx.globals().set("__post", post_fn)?;

    let close_fn = Function::new(ctx.clone(), move || {
        closed.store(true, Ordering::SeqCst);
    })?;
    ctx.globals().set("__close", close_fn)?;

    let log_fn = Function::new(ctx.clone(), |message: String| {
        log::info!("[worker] {}", message);
    })?;
    ctx.globals().set("__log", log_fn)?;

    // __fetch(url, { method, headers, body }) -> JSON string of { status, body }
    let fetch_fn = Function::new(
        ctx.clone(),
        |ctx: Ctx<'js>, url: String, options: Object<'js>| -> rquickjs::Result<String> {
            let request = FetchRequest::from_options(url, &options);
            let reply = request
                .send()
                .map_err(|e| Exception::throw_message(&ctx, &format!("fetch {} failed: {}", request.url, e)))?;
            serde_json::to_string(&reply).map_err(|e| Exception::throw_message(&ctx, &e.to_string()))
        },
    )?;
    ctx.globals().set("__fetch", fetch_fn)?;

    Ok(())
}

/// Upper bound on a response body handed to a bundle
const FETCH_BODY_LIMIT: u64 = 10_000_000;

struct FetchRequest {
    url: String,
    method: String,
    headers: Vec<(String, String)>,
    body: Option<String>,
}

#[derive(Debug, Serialize)]
struct FetchReply {
    status: u16,
    body: String,
}

impl FetchRequest {
    fn from_options(url: String, options: &Object<'_>) -> Self {
        let method = options
            .get::<_, Option<String>>("method")
            .ok()
            .flatten()
            .map(|m| m.to_ascii_uppercase())
            .unwrap_or_else(|| "GET".to_string());

        let mut headers = Vec::new();
        if let Ok(Some(table)) = options.get::<_, Option<Object>>("headers") {
            for name in table.keys::<String>().flatten() {
                if let Ok(value) = table.get::<_, String>(&name) {
                    headers.push((name, value));
                }
            }
        }

        Self {
            url,
            method,
            headers,
            body: options.get::<_, Option<String>>("body").ok().flatten(),
        }
    }

    /// Blocking; only called from the worker thread
    fn send(&self) -> Result<FetchReply, ureq::Error> {
        use std::io::Read;

        log::debug!("Worker fetch {} {}", self.method, self.url);

        let mut request = ureq::request(&self.method, &self.url);
        for (name, value) in &self.headers {
            request = request.set(name, value);
        }

        let sent = match &self.body {
            Some(body) => request.send_string(body),
            None => request.call(),
        };
        // Error statuses still reach the bundle
        let response = match sent {
            Err(ureq::Error::Status(_, response)) => response,
            other => other?,
        };

        let status = response.status();
        let mut body = String::new();
        if let Err(e) = response
            .into_reader()
            .take(FETCH_BODY_LIMIT)
            .read_to_string(&mut body)
        {
            log::warn!("Worker fetch {} body unreadable: {}", self.url, e);
        }

        Ok(FetchReply { status, body })
    }
}

/// Readable message for a failed evaluation, pulling the pending exception
fn describe_error(ctx: &Ctx<'_>, error: rquickjs::Error) -> String {
    if !matches!(error, rquickjs::Error::Exception) {
        return error.to_string();
    }

    let exception = ctx.catch();
    match exception.as_exception() {
        Some(exception) => exception
            .message()
            .unwrap_or_else(|| "uncaught exception".to_string()),
        None => format!("uncaught exception: {:?}", exception),
    }
}
