//! Connector: the one façade the application owns. Holds both channels, routes outbound calls
//! by message shape, and funnels inbound traffic from both listener threads into one handler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::info;
use netcore_core::{
    Inbound, LinkSpec, NetCoreError, Notification, PayloadMessage, PendingCalls, Value,
};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::dispatch::{Dispatcher, Handler};
use crate::reliable::{LinkState, ReliableChannel};
use crate::unreliable::UnreliableChannel;

pub struct Connector {
    spec: Arc<LinkSpec>,
    dispatcher: Arc<Dispatcher>,
    pending: Arc<PendingCalls>,
    unreliable: UnreliableChannel,
    reliable: ReliableChannel,
    stopped: AtomicBool,
    killed: AtomicBool,
}

impl Connector {
    /// Open both channels and start their listeners. Messages arriving before a handler is
    /// registered are dropped; use [`Connector::with_handler`] to avoid that window.
    pub fn new(spec: LinkSpec) -> Result<Self, NetCoreError> {
        Self::start(spec, None)
    }

    pub fn with_handler<F>(spec: LinkSpec, handler: F) -> Result<Self, NetCoreError>
    where
        F: Fn(&mut Inbound) + Send + Sync + 'static,
    {
        let handler: Arc<Handler> = Arc::new(handler);
        Self::start(spec, Some(handler))
    }

    fn start(spec: LinkSpec, handler: Option<Arc<Handler>>) -> Result<Self, NetCoreError> {
        spec.validate()?;
        let spec = Arc::new(spec);
        let dispatcher = Arc::new(Dispatcher::new());
        if let Some(handler) = handler {
            dispatcher.set_handler(handler);
        }
        let pending = Arc::new(PendingCalls::new());
        let unreliable = UnreliableChannel::open(spec.clone(), dispatcher.clone())?;
        let reliable = ReliableChannel::open(spec.clone(), pending.clone(), dispatcher.clone())?;
        unreliable.start()?;
        if let Err(e) = reliable.start() {
            unreliable.kill();
            return Err(e);
        }
        info!(
            "netcore {} up: notifications on {}, reliable link via {}",
            spec.role,
            unreliable.listen_addr(),
            reliable.addr()
        );
        Ok(Self {
            spec,
            dispatcher,
            pending,
            unreliable,
            reliable,
            stopped: AtomicBool::new(false),
            killed: AtomicBool::new(false),
        })
    }

    /// Register (or replace) the single inbound handler. Called from inside a handler, the
    /// swap takes effect once that invocation returns.
    pub fn on_message_received<F>(&self, handler: F)
    where
        F: Fn(&mut Inbound) + Send + Sync + 'static,
    {
        self.dispatcher.set_handler(Arc::new(handler));
    }

    /// Tag-only notification over the unreliable channel. Best-effort.
    pub fn send_message(&self, type_tag: &str) -> Result<(), NetCoreError> {
        self.unreliable.send(&Notification::new(type_tag))
    }

    /// Fire-and-forget payload over the reliable channel.
    pub fn send_payload(&self, type_tag: &str, value: Value) -> Result<(), NetCoreError> {
        self.reliable.send(PayloadMessage::new(type_tag, Some(value)))
    }

    /// Blocking call; returns whatever the remote handler set via `set_return_value`.
    pub fn send_synced_message(
        &self,
        type_tag: &str,
        value: Option<Value>,
    ) -> Result<Option<Value>, NetCoreError> {
        self.reliable.send_synced(type_tag, value)
    }

    /// Typed synced call: bincode in, bincode out.
    pub fn call<A, R>(&self, type_tag: &str, arg: &A) -> Result<Option<R>, NetCoreError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let reply = self.send_synced_message(type_tag, Some(Value::encode(arg)?))?;
        reply.map(|v| v.decode::<R>()).transpose()
    }

    pub fn spec(&self) -> &LinkSpec {
        &self.spec
    }

    pub fn link_state(&self) -> LinkState {
        self.reliable.state()
    }

    pub fn wait_connected(&self, timeout: Duration) -> bool {
        self.reliable.wait_for_state(LinkState::Connected, timeout)
    }

    /// Synced calls currently waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// Stop both listeners and release blocked synced callers. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.unreliable.stop();
        self.reliable.stop();
        self.pending.fail_all();
        info!("netcore {} stopped", self.spec.role);
    }

    /// Stop, close the handler and join both listener threads. Once this returns the
    /// handler is never invoked again. Idempotent.
    pub fn kill(&self) {
        if self.killed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop();
        self.dispatcher.close();
        self.unreliable.kill();
        self.reliable.kill();
        self.pending.fail_all();
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netcore_core::Role;

    #[test]
    fn invalid_spec_rejected_before_any_socket() {
        let spec = LinkSpec::loopback(46310, Role::Server).with_synced_call_timeout(Duration::ZERO);
        assert!(matches!(
            Connector::new(spec),
            Err(NetCoreError::InvalidSpec(_))
        ));
    }

    #[test]
    fn second_server_on_same_ports_fails_to_start() {
        let first = Connector::new(LinkSpec::loopback(46320, Role::Server)).unwrap();
        assert!(matches!(
            Connector::new(LinkSpec::loopback(46320, Role::Server)),
            Err(NetCoreError::Construction { .. })
        ));
        first.kill();
    }

    #[test]
    fn stop_and_kill_are_idempotent() {
        let client = Connector::new(LinkSpec::loopback(46330, Role::Client)).unwrap();
        client.stop();
        client.stop();
        assert!(matches!(
            client.send_synced_message("ADD", None),
            Err(NetCoreError::NotConnected)
        ));
        client.kill();
        client.kill();
        assert_eq!(client.link_state(), LinkState::Disconnected);
    }
}
