//! Pull-to-push diagnostics bridge.
//!
//! For clients that did not advertise pull-diagnostic capability, the mux
//! emulates push diagnostics: file events schedule a debounced
//! `textDocument/diagnostic` pull against the server, and the result is
//! republished as `textDocument/publishDiagnostics`.
//!
//! The bridge holds no I/O. Every input returns the list of side effects the
//! mux should perform, which keeps the whole state machine testable without
//! a runtime.

use core::time::Duration;
use std::collections::HashMap;

use lsp_proto::Response;
use serde_json::Value;

/// Side effects requested from the mux.
#[derive(Debug, PartialEq)]
pub(crate) enum BridgeAction {
    /// Start a debounce timer; deliver `on_timer(uri, generation)` on expiry.
    ArmTimer {
        uri: String,
        generation: u64,
        delay: Duration,
    },
    /// Issue a `textDocument/diagnostic` pull under an internal request id.
    SendPull { uri: String },
    /// Emit `textDocument/publishDiagnostics` to every non-pull client.
    Publish { uri: String, items: Value },
}

pub(crate) struct Bridge {
    debounce: Duration,
    init_done: bool,
    /// URIs seen before the initialize handshake completed.
    pending_init: Vec<String>,
    states: HashMap<String, UriState>,
    next_generation: u64,
}

#[derive(Default)]
struct UriState {
    /// Items last published for this URI, replayed on an `unchanged` reply.
    last_published: Option<Value>,
    in_flight: bool,
    /// Generation of the armed debounce timer; stale firings are ignored.
    armed: Option<u64>,
    /// File events observed while a pull was in flight.
    dirty: bool,
}

impl Bridge {
    pub(crate) fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            init_done: false,
            pending_init: Vec::new(),
            states: HashMap::new(),
            next_generation: 0,
        }
    }

    /// `didOpen`/`didChange`/`didSave` observed for `uri`.
    pub(crate) fn on_file_event(&mut self, uri: String) -> Vec<BridgeAction> {
        if !self.init_done {
            if !self.pending_init.contains(&uri) {
                self.pending_init.push(uri);
            }
            return Vec::new();
        }
        self.schedule(uri)
    }

    /// The cached initialize response is now available; schedule everything
    /// that accumulated in the meantime.
    pub(crate) fn on_init_done(&mut self) -> Vec<BridgeAction> {
        self.init_done = true;
        let pending = core::mem::take(&mut self.pending_init);
        let mut actions = Vec::new();
        for uri in pending {
            actions.extend(self.schedule(uri));
        }
        actions
    }

    /// A debounce timer fired. `any_non_pull` gates the actual pull: with no
    /// client to publish to, the request is pointless.
    pub(crate) fn on_timer(&mut self, uri: &str, generation: u64, any_non_pull: bool) -> Vec<BridgeAction> {
        let Some(state) = self.states.get_mut(uri) else {
            return Vec::new();
        };
        if state.armed != Some(generation) {
            // Cancelled by `didClose` or superseded.
            return Vec::new();
        }
        state.armed = None;

        if !any_non_pull {
            return Vec::new();
        }

        state.in_flight = true;
        state.dirty = false;
        vec![BridgeAction::SendPull { uri: uri.to_owned() }]
    }

    /// The server answered a bridge-initiated pull for `uri`.
    pub(crate) fn on_response(&mut self, uri: &str, response: &Response) -> Vec<BridgeAction> {
        let cached = self.states.get(uri).and_then(|state| state.last_published.as_ref());
        let items = items_from_response(response, cached);

        let state = self.states.entry(uri.to_owned()).or_default();
        state.in_flight = false;
        state.last_published = Some(items.clone());
        let dirty = core::mem::take(&mut state.dirty);

        let mut actions = vec![BridgeAction::Publish {
            uri: uri.to_owned(),
            items,
        }];
        if dirty {
            actions.extend(self.schedule(uri.to_owned()));
        }
        actions
    }

    /// `didClose` observed: forget everything about `uri`.
    pub(crate) fn on_close(&mut self, uri: &str) {
        self.states.remove(uri);
        self.pending_init.retain(|pending| pending != uri);
    }

    fn schedule(&mut self, uri: String) -> Vec<BridgeAction> {
        let state = self.states.entry(uri.clone()).or_default();

        if state.in_flight {
            state.dirty = true;
            return Vec::new();
        }
        if state.armed.is_some() {
            // Coalesce into the timer already counting down.
            return Vec::new();
        }

        let generation = self.next_generation;
        self.next_generation += 1;
        state.armed = Some(generation);

        vec![BridgeAction::ArmTimer {
            uri,
            generation,
            delay: self.debounce,
        }]
    }
}

/// Items to publish for a pull reply, per the diagnostic report kinds:
/// `full` publishes (and caches) `items`, `unchanged` replays the cache, a
/// bare `items` array is published as-is, anything else clears.
fn items_from_response(response: &Response, cached: Option<&Value>) -> Value {
    let empty = || Value::Array(Vec::new());

    let Some(result) = response.result() else {
        return empty();
    };

    match result.get("kind").and_then(Value::as_str) {
        Some("full") => result.get("items").cloned().unwrap_or_else(empty),
        Some("unchanged") => cached.cloned().unwrap_or_else(empty),
        _ => match result.get("items") {
            Some(items @ Value::Array(_)) => items.clone(),
            _ => empty(),
        },
    }
}
