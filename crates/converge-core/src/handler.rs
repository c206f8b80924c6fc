use crate::events::EventSink;
use crate::progress::{CallbackContext, ProgressEvent};
use tracing::info;

/// A reconciler for one kind of resource.
///
/// `handle` is re-entered from its first step on every invocation of a
/// logical operation; work already done is skipped through the context.
pub trait ResourceHandler {
    type Request;
    type Model;

    fn kind(&self) -> &'static str;

    /// The model a fresh invocation starts from.
    fn initial_model(&self, request: &Self::Request) -> Self::Model;

    fn handle(
        &self,
        request: &Self::Request,
        progress: ProgressEvent<Self::Model>,
        sink: &dyn EventSink,
    ) -> ProgressEvent<Self::Model>;
}

/// One scheduler invocation. A missing context starts a new logical operation.
pub fn invoke<H: ResourceHandler>(
    handler: &H,
    request: &H::Request,
    context: Option<CallbackContext>,
    sink: &dyn EventSink,
) -> ProgressEvent<H::Model> {
    let resumed = context.is_some();
    let context = context.unwrap_or_default();
    let initial = ProgressEvent::progress(handler.initial_model(request), context);
    let result = handler.handle(request, initial, sink);
    info!(
        kind = handler.kind(),
        resumed,
        status = %result.status,
        delay = result.callback_delay_seconds,
        "invocation finished"
    );
    result
}
