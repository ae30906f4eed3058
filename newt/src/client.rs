//! The cooperative client loop.
//!
//! Everything happens inside [`Client::step`]: at most one message is
//! consumed from the wire and at most one produced, timers advance,
//! sessions hand their business to the exchange engine, and the caller
//! gets back the deadline it should call again by. Potentially
//! blocking transport calls surface as `WouldBlock` and are retried on
//! the next step.

use log::{debug, trace, warn};
use newt_cbor::Chunk;
use newt_msg::opt::num;
use newt_msg::{udp, Block, BlockKind, Code, ContentFormat, Message, Options,
               Token, Type};
use no_std_net::SocketAddr;

use crate::config::Config;
use crate::dm::{self, oid, security, server, DataModel};
use crate::exchange::{Disposition, Exchange, ExchangeError, NoPayload, Outcome,
                      PayloadChunk, PayloadSource, State, TimeoutAction};
use crate::io::link::{DiscoverPayload, RegisterPayload};
use crate::io::{InCtx, InKind, IoError, OutCtx, OutKind};
use crate::net::{Transport, TransportState};
use crate::observe::{gate, Attributes, AttrStore, NotifyVerdict, Observations};
use crate::path::{Level, UriPath};
use crate::req::{recognize, Inbound, Operation};
use crate::send::{SendId, SendQueue, SendResult};
use crate::session::register::{Phase as RegPhase, RegEvent, RegRequest};
use crate::session::{Bootstrap, Registration};
use crate::time::sooner_ms;
use crate::value::{InValue, OutRecord, OutValue};

/// Datagram buffer length
pub const BUF_LEN: usize = 1280;

/// Payload staging length: the largest single block
pub const PAYLOAD_LEN: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq)]
enum ActiveOp {
  None,
  Register,
  Update { with_payload: bool },
  Deregister,
  BootstrapRequest,
  Send,
  Notify { token: Token, value: Option<f64> },
}

// a server Write/Create arriving over several Block1 transfers
#[derive(Debug)]
struct ServerWrite {
  ctx: InCtx,
  op: Operation,
  path: UriPath,
  next_block: u32,
  created_iid: Option<u16>,
}

/// What [`Client::step`] reports back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
  /// Call [`Client::step`] again no later than this (ms since the
  /// clock's epoch); `None` when only external input needs service
  pub next_deadline_ms: Option<u64>,
}

/// The LwM2M client core. One server binding at a time, plus an
/// optional bootstrap server.
#[derive(Debug)]
pub struct Client<'a> {
  config: Config,
  server_addr: SocketAddr,
  bootstrap_addr: Option<SocketAddr>,

  exchange: Exchange,
  registration: Registration,
  bootstrap: Bootstrap,
  observations: Observations,
  attrs: AttrStore,
  send_queue: SendQueue<'a>,

  active: ActiveOp,
  register_payload: Option<RegisterPayload>,
  send_ctx: Option<OutCtx<'a>>,
  send_next_record: usize,
  send_record_open: bool,
  notify_skip: usize,
  server_write: Option<ServerWrite>,

  send_buf: [u8; BUF_LEN],
  wire_len: usize,
  wire_off: usize,
  wire_unsent: bool,

  resp_buf: [u8; BUF_LEN],
  resp_len: usize,
  resp_off: usize,

  connected_to: Option<SocketAddr>,
  started: bool,
  bootstrap_requested: bool,
  restart_requested: bool,
  notify_deadline_ms: Option<u64>,
}

// ---- payload sources ------------------------------------------------

struct RegisterSource<'s, 'd> {
  payload: &'s mut RegisterPayload,
  dm: &'d dyn DataModel,
}

impl PayloadSource for RegisterSource<'_, '_> {
  fn pull(&mut self, buf: &mut [u8]) -> Result<PayloadChunk, ExchangeError> {
    let (len, more) = self.payload
                          .get_payload(self.dm, buf)
                          .map_err(|_| ExchangeError::InputArg)?;
    Ok(PayloadChunk { len,
                      format: Some(ContentFormat::LinkFormat),
                      more })
  }
}

struct SendSource<'s, 'a> {
  ctx: &'s mut OutCtx<'a>,
  records: &'a [OutRecord<'a>],
  next: &'s mut usize,
  record_open: &'s mut bool,
}

impl PayloadSource for SendSource<'_, '_> {
  fn pull(&mut self, buf: &mut [u8]) -> Result<PayloadChunk, ExchangeError> {
    let mut filled = 0;
    loop {
      if !*self.record_open {
        if *self.next >= self.records.len() {
          return Ok(PayloadChunk { len: filled,
                                   format: Some(self.ctx.format()),
                                   more: false });
        }
        self.ctx
            .new_entry(self.records[*self.next])
            .map_err(|_| ExchangeError::InputArg)?;
        *self.next += 1;
        *self.record_open = true;
      }

      let (n, more) = self.ctx
                          .get_payload(&mut buf[filled..])
                          .map_err(|_| ExchangeError::InputArg)?;
      filled += n;
      if more {
        // the block is full; this record resumes in the next one
        return Ok(PayloadChunk { len: filled,
                                 format: Some(self.ctx.format()),
                                 more: true });
      }
      *self.record_open = false;
    }
  }
}

// notification payloads are regenerated from the data model for every
// block, skipping what already went out — nothing borrowed has to
// survive a step
struct NotifySource<'s, 'd> {
  dm: &'d dyn DataModel,
  path: UriPath,
  format: Option<ContentFormat>,
  skip: &'s mut usize,
}

impl PayloadSource for NotifySource<'_, '_> {
  fn pull(&mut self, buf: &mut [u8]) -> Result<PayloadChunk, ExchangeError> {
    let (len, format, more) =
      render_read_payload(self.dm, &self.path, OutKind::Notify, self.format,
                          *self.skip, buf).map_err(|_| ExchangeError::InputArg)?;
    *self.skip += len;
    Ok(PayloadChunk { len,
                      format: Some(format),
                      more })
  }
}

// ---- data-model walking ---------------------------------------------

fn value_as_f64(value: &OutValue) -> Option<f64> {
  match *value {
    | OutValue::Int(v) => Some(v as f64),
    | OutValue::Uint(v) => Some(v as f64),
    | OutValue::Double(v) => Some(v),
    | OutValue::Time(v) => Some(v as f64),
    | _ => None,
  }
}

// visit the readable record paths below `base` in path order; stop
// early when `visit` says so
fn walk_records(dm: &dyn DataModel,
                base: &UriPath,
                visit: &mut dyn FnMut(UriPath) -> bool)
                -> bool {
  match base.len() {
    | 3 | 4 => visit(*base),
    | 2 => {
      let (o, i) = (base.oid().unwrap_or(0), base.iid().unwrap_or(0));
      for r in 0..dm.resource_count(o, i) {
        let Some(info) = dm.resource(o, i, r) else { continue };
        match info.dim {
          | None => {
            if !visit(UriPath::resource(o, i, info.rid)) {
              return false;
            }
          },
          | Some(_) => {
            let mut at = 0;
            while let Some(riid) = dm.resource_instance(o, i, info.rid, at) {
              if !visit(UriPath::resource_instance(o, i, info.rid, riid)) {
                return false;
              }
              at += 1;
            }
          },
        }
      }
      true
    },
    | 1 => {
      let o = base.oid().unwrap_or(0);
      for idx in 0..dm.instance_count(o) {
        let Some(i) = dm.instance(o, idx) else { continue };
        if !walk_records(dm, &UriPath::instance(o, i), visit) {
          return false;
        }
      }
      true
    },
    | _ => true,
  }
}

fn count_records(dm: &dyn DataModel, base: &UriPath) -> usize {
  let mut count = 0;
  walk_records(dm, base, &mut |p| {
    if dm.read(&p).is_ok() {
      count += 1;
    }
    true
  });
  count
}

fn nth_record(dm: &dyn DataModel, base: &UriPath, n: usize) -> Option<UriPath> {
  let mut seen = 0;
  let mut found = None;
  walk_records(dm, base, &mut |p| {
    if dm.read(&p).is_ok() {
      if seen == n {
        found = Some(p);
        return false;
      }
      seen += 1;
    }
    true
  });
  found
}

/// Render (part of) a Read/Notify payload. The payload is regenerated
/// from the data model and the first `skip` bytes discarded, so a
/// block-wise reader needs no state but an offset. Yields
/// `(bytes, chosen_format, more)`.
pub(crate) fn render_read_payload(dm: &dyn DataModel,
                                  base: &UriPath,
                                  kind: OutKind,
                                  format: Option<ContentFormat>,
                                  mut skip: usize,
                                  out: &mut [u8])
                                  -> Result<(usize, ContentFormat, bool), IoError> {
  let count = count_records(dm, base);
  let mut ctx = OutCtx::new(kind, base, count, format)?;
  let chosen = ctx.format();

  let mut scratch = [0u8; 128];
  let mut out_used = 0;
  let mut fed = 0;
  let mut record_open = count == 0;

  loop {
    if !record_open {
      if fed == count {
        return Ok((out_used, chosen, false));
      }
      let path = nth_record(dm, base, fed).ok_or(IoError::InputArg)?;
      let value = dm.read(&path).map_err(|_| IoError::InputArg)?;
      ctx.new_entry(OutRecord { path,
                                timestamp: None,
                                value })?;
      fed += 1;
      record_open = true;
    }

    let (n, more_rec) = if skip > 0 {
      let space = scratch.len().min(skip);
      let (n, m) = ctx.get_payload(&mut scratch[..space])?;
      skip -= n;
      (0, m)
    } else {
      if out_used == out.len() {
        return Ok((out_used, chosen, true));
      }
      ctx.get_payload(&mut out[out_used..])?
    };
    out_used += n;

    if !more_rec {
      if count == 0 {
        return Ok((out_used, chosen, false));
      }
      record_open = false;
    }
  }
}

// a usable post-bootstrap data model: a non-bootstrap Security
// instance and a Server instance whose SSID matches it
fn bootstrap_data_valid(dmod: &dyn DataModel) -> bool {
  let mut at = 0;
  while let Some(iid) = {
          let next = dmod.instance(oid::SECURITY, at);
          at += 1;
          next
        }
  {
    let is_bs =
      dm::read_bool(dmod,
                    &UriPath::resource(oid::SECURITY, iid,
                                       security::BOOTSTRAP_SERVER)).unwrap_or(false);
    if is_bs {
      continue;
    }
    let Some(ssid) =
      dm::read_u16(dmod, &UriPath::resource(oid::SECURITY, iid, security::SSID))
    else {
      continue;
    };

    let mut srv_at = 0;
    while let Some(srv_iid) = {
            let next = dmod.instance(oid::SERVER, srv_at);
            srv_at += 1;
            next
          }
    {
      if dm::read_u16(dmod,
                      &UriPath::resource(oid::SERVER, srv_iid, server::SSID))
         == Some(ssid)
      {
        return true;
      }
    }
  }
  false
}

// ---- the client -----------------------------------------------------

impl<'a> Client<'a> {
  /// A client for `config`, talking to `server_addr` (and
  /// `bootstrap_addr` when bootstrap is needed)
  pub fn new(config: Config,
             server_addr: SocketAddr,
             bootstrap_addr: Option<SocketAddr>)
             -> Self {
    let exchange = Exchange::new(config.coap, config.random_seed);
    let registration = Registration::new(config.lifetime);
    Client { config,
             server_addr,
             bootstrap_addr,
             exchange,
             registration,
             bootstrap: Bootstrap::new(),
             observations: Observations::default(),
             attrs: AttrStore::default(),
             send_queue: SendQueue::new(),
             active: ActiveOp::None,
             register_payload: None,
             send_ctx: None,
             send_next_record: 0,
             send_record_open: false,
             notify_skip: 0,
             server_write: None,
             send_buf: [0; BUF_LEN],
             wire_len: 0,
             wire_off: 0,
             wire_unsent: false,
             resp_buf: [0; BUF_LEN],
             resp_len: 0,
             resp_off: 0,
             connected_to: None,
             started: false,
             bootstrap_requested: false,
             restart_requested: false,
             notify_deadline_ms: None }
  }

  /// The registration session's phase
  pub fn registration_phase(&self) -> RegPhase {
    self.registration.phase()
  }

  /// Whether a bootstrap attempt is running
  pub fn bootstrapping(&self) -> bool {
    self.bootstrap.is_active()
  }

  /// Enqueue a Send request (POST `/dp`)
  pub fn send(&mut self,
              dmod: &dyn DataModel,
              records: &'a [OutRecord<'a>],
              format: Option<ContentFormat>,
              completion: Option<&'a dyn crate::send::SendCompletion>)
              -> Result<SendId, crate::send::SendError> {
    let muted = self.server_iid(dmod)
                    .and_then(|iid| {
                      dm::read_bool(dmod,
                                    &UriPath::resource(oid::SERVER, iid,
                                                       server::MUTE_SEND))
                    })
                    .unwrap_or(false);
    self.send_queue.new_request(records, format, completion, muted)
  }

  /// Abort a queued (or in-flight) Send request
  pub fn abort_send(&mut self, id: SendId) {
    if self.send_queue.abort(id) {
      self.exchange.terminate();
      self.finish_active_exchange_silently();
    }
  }

  /// The application changed a value at `path`
  pub fn data_model_changed(&mut self, path: &UriPath) {
    self.observations.mark_changed(path);
  }

  /// The application added/removed Objects or Instances
  pub fn data_model_shape_changed(&mut self) {
    self.registration.data_model_changed();
  }

  /// Ask for an early registration Update
  pub fn trigger_update(&mut self) {
    self.registration.trigger_update();
  }

  /// Ask for a bootstrap (outranks registration)
  pub fn request_bootstrap(&mut self) {
    self.bootstrap_requested = true;
  }

  /// Deregister, then register afresh
  pub fn restart(&mut self) {
    self.exchange.terminate();
    self.finish_active_exchange_silently();
    self.restart_requested = true;
  }

  fn server_iid(&self, dmod: &dyn DataModel) -> Option<u16> {
    dmod.instance(oid::SERVER, 0)
  }

  fn finish_active_exchange_silently(&mut self) {
    self.exchange.take_outcome();
    self.active = ActiveOp::None;
    self.register_payload = None;
    self.send_ctx = None;
    self.wire_unsent = false;
  }

  // ---- the step loop ------------------------------------------------

  /// Run one slice of the client. Call from the application main loop,
  /// then again no later than the returned deadline.
  pub fn step(&mut self,
              now_ms: u64,
              net: &mut dyn Transport,
              dmod: &mut dyn DataModel)
              -> Step {
    self.ensure_started(dmod, now_ms);

    if self.restart_requested && !self.exchange.is_active() {
      self.restart_requested = false;
      self.registration.disable();
      self.registration.set_disable_timeout(0);
    }

    // writes before reads: get pending bytes out first
    self.flush_wire(net, now_ms);
    self.flush_response(net);

    self.pump_recv(net, dmod, now_ms);
    self.flush_response(net);

    self.pump_retransmission(net, now_ms);
    self.bootstrap.check_timeout(&self.config, now_ms);
    self.pump_queue_mode(net, now_ms);
    self.pump_business(net, dmod, now_ms);
    self.pump_exchange_out(net, dmod, now_ms);
    self.flush_wire(net, now_ms);

    Step { next_deadline_ms: self.deadline(now_ms) }
  }

  fn ensure_started(&mut self, dmod: &dyn DataModel, now_ms: u64) {
    if self.started {
      if self.bootstrap_requested && !self.bootstrap.is_active() {
        self.begin_bootstrap(dmod, now_ms);
      }
      return;
    }
    self.started = true;

    // bootstrap outranks registration when both apply
    let server_usable = bootstrap_data_valid(dmod);
    if self.bootstrap_requested || !server_usable {
      self.begin_bootstrap(dmod, now_ms);
    } else {
      self.registration.start();
    }
  }

  fn begin_bootstrap(&mut self, dmod: &dyn DataModel, now_ms: u64) {
    self.bootstrap_requested = false;
    let hold_off = self.bootstrap_security_iid(dmod)
                       .and_then(|iid| {
                         dm::read_u32(dmod,
                                      &UriPath::resource(oid::SECURITY, iid,
                                                         security::CLIENT_HOLD_OFF))
                       })
                       .unwrap_or(0);
    self.bootstrap.start(now_ms, hold_off);
  }

  fn bootstrap_security_iid(&self, dmod: &dyn DataModel) -> Option<u16> {
    let mut at = 0;
    while let Some(iid) = dmod.instance(oid::SECURITY, at) {
      at += 1;
      if dm::read_bool(dmod,
                       &UriPath::resource(oid::SECURITY, iid,
                                          security::BOOTSTRAP_SERVER))
            .unwrap_or(false)
      {
        return Some(iid);
      }
    }
    None
  }

  // ---- wire plumbing ------------------------------------------------

  fn target_addr(&self) -> SocketAddr {
    if self.bootstrap.is_active() {
      self.bootstrap_addr.unwrap_or(self.server_addr)
    } else {
      self.server_addr
    }
  }

  fn ensure_connected(&mut self,
                      net: &mut dyn Transport,
                      queue_wake: bool,
                      now_ms: u64)
                      -> bool {
    let target = self.target_addr();
    if self.connected_to == Some(target)
       && net.state() == TransportState::Connected
    {
      return true;
    }

    match net.state() {
      | TransportState::Connected if self.connected_to != Some(target) => {
        let _ = net.close();
        false
      },
      | TransportState::Closed | TransportState::Bound if queue_wake => {
        match net.reuse_last_port() {
          | Ok(()) => {
            debug!("reopened from the retained local port");
            self.connected_to = Some(target);
            self.registration.left_queue_mode();
            true
          },
          | Err(nb::Error::WouldBlock) => false,
          | Err(nb::Error::Other(e)) => {
            warn!("reopen failed: {:?}", e);
            false
          },
        }
      },
      | TransportState::Closed | TransportState::Bound => {
        match net.connect(target) {
          | Ok(()) => {
            self.connected_to = Some(target);
            true
          },
          | Err(nb::Error::WouldBlock) => false,
          | Err(nb::Error::Other(e)) => {
            warn!("connect failed: {:?}", e);
            if self.bootstrap.is_active() {
              self.bootstrap.on_connect_failure(&self.config, now_ms);
            }
            false
          },
        }
      },
      | _ => false,
    }
  }

  fn flush_wire(&mut self, net: &mut dyn Transport, now_ms: u64) {
    if !self.wire_unsent {
      return;
    }
    while self.wire_off < self.wire_len {
      match net.send(&self.send_buf[self.wire_off..self.wire_len]) {
        | Ok(n) => self.wire_off += n,
        | Err(nb::Error::WouldBlock) => return,
        | Err(nb::Error::Other(e)) => {
          warn!("send failed: {:?}", e);
          self.exchange.terminate();
          self.route_outcome(Outcome::Terminated, None, now_ms);
          return;
        },
      }
    }
    self.wire_unsent = false;
    self.wire_off = 0;
    self.exchange.on_sent(now_ms);
    trace!("sent {} bytes", self.wire_len);

    // NonConfirmable exchanges are over the moment they leave
    if let Some(outcome) = self.exchange.take_outcome() {
      self.route_outcome(outcome, None, now_ms);
      self.touch(now_ms);
    }
  }

  fn flush_response(&mut self, net: &mut dyn Transport) {
    while self.resp_off < self.resp_len {
      match net.send(&self.resp_buf[self.resp_off..self.resp_len]) {
        | Ok(n) => self.resp_off += n,
        | Err(nb::Error::WouldBlock) => return,
        | Err(nb::Error::Other(e)) => {
          warn!("response send failed: {:?}", e);
          break;
        },
      }
    }
    self.resp_len = 0;
    self.resp_off = 0;
  }

  fn pump_recv(&mut self, net: &mut dyn Transport, dmod: &mut dyn DataModel, now_ms: u64) {
    if net.state() != TransportState::Connected || self.resp_len > 0 {
      return;
    }
    let mut buf = [0u8; BUF_LEN];
    let n = match net.recv(&mut buf) {
      | Ok(n) if n > 0 => n,
      | Ok(_) | Err(nb::Error::WouldBlock) => return,
      | Err(nb::Error::Other(e)) => {
        warn!("recv failed: {:?}", e);
        self.exchange.terminate();
        self.route_outcome(Outcome::Terminated, None, now_ms);
        return;
      },
    };

    let datagram = match udp::decode(&buf[..n]) {
      | Ok(d) => d,
      | Err(e) => {
        debug!("dropping malformed datagram: {:?}", e);
        return;
      },
    };
    let inbound = match recognize(&datagram.msg, datagram.ty, datagram.id) {
      | Ok(inbound) => inbound,
      | Err(e) => {
        debug!("unrecognizable message: {:?}", e);
        return;
      },
    };

    match self.exchange.handle_inbound(&inbound) {
      | Disposition::Complete => {
        if inbound.ty == Type::Con {
          // separate response: acknowledge receipt
          self.queue_empty_ack(inbound.msg_id);
        }
        let outcome = self.exchange.take_outcome().unwrap_or(Outcome::Done);
        self.route_outcome(outcome, Some(&inbound), now_ms);
        self.touch(now_ms);
      },
      | Disposition::NextBlock | Disposition::ResponsePiece => {
        self.touch(now_ms);
      },
      | Disposition::Acked => {},
      | Disposition::NotMine => {
        self.handle_server_message(&inbound, dmod, now_ms);
      },
    }
  }

  fn pump_retransmission(&mut self, net: &mut dyn Transport, now_ms: u64) {
    match self.exchange.on_timeout(now_ms) {
      | TimeoutAction::Resend => {
        debug!("retransmitting");
        self.wire_unsent = true;
        self.wire_off = 0;
        self.flush_wire(net, now_ms);
      },
      | TimeoutAction::GaveUp => {
        let outcome = self.exchange.take_outcome().unwrap_or(Outcome::Timeout);
        self.route_outcome(outcome, None, now_ms);
      },
      | TimeoutAction::Wait => {},
    }
  }

  fn pump_queue_mode(&mut self, net: &mut dyn Transport, now_ms: u64) {
    if !self.config.queue_mode
       || !self.registration.queue_timer_expired(now_ms)
       || self.exchange.is_active()
       || self.wire_unsent
       || self.resp_len > 0
    {
      return;
    }
    match net.close() {
      | Ok(()) | Err(nb::Error::Other(_)) => {
        debug!("entering queue mode");
        self.connected_to = None;
        self.registration.entered_queue_mode();
      },
      | Err(nb::Error::WouldBlock) => {},
    }
  }

  fn touch(&mut self, now_ms: u64) {
    self.registration
        .touch(now_ms, self.config.queue_mode, self.config.queue_timeout());
  }

  // ---- business scheduling ------------------------------------------

  fn pump_business(&mut self, net: &mut dyn Transport, dmod: &mut dyn DataModel, now_ms: u64) {
    if self.exchange.is_active() || self.wire_unsent {
      return;
    }

    // bootstrap wins over everything else
    if self.bootstrap.is_active() {
      if self.bootstrap.due(now_ms) && self.ensure_connected(net, false, now_ms) {
        let preferred = self.preferred_bootstrap_format();
        if let Ok(request) = self.bootstrap.build(&self.config, preferred) {
          if self.begin(request, now_ms, net).is_ok() {
            self.active = ActiveOp::BootstrapRequest;
          }
        }
      }
      return;
    }
    if self.bootstrap.take_done() {
      debug!("bootstrap complete, registering");
      self.registration.start();
    }

    let queue_wake = self.registration.phase() == RegPhase::QueueMode;

    if let Some(reg_req) = self.registration.due(now_ms) {
      if !self.ensure_connected(net, queue_wake, now_ms) {
        return;
      }
      if let Ok(request) = self.registration.build(reg_req, &self.config) {
        if self.begin(request, now_ms, net).is_ok() {
          self.active = match reg_req {
            | RegRequest::Register => {
              self.register_payload = Some(RegisterPayload::new());
              ActiveOp::Register
            },
            | RegRequest::Update => {
              let with_payload = self.registration.update_needs_payload();
              if with_payload {
                self.register_payload = Some(RegisterPayload::new());
              }
              ActiveOp::Update { with_payload }
            },
            | RegRequest::Deregister => ActiveOp::Deregister,
          };
        }
      }
      return;
    }

    if self.registration.phase() != RegPhase::Registered
       && self.registration.phase() != RegPhase::QueueMode
    {
      return;
    }

    if self.pump_notifications(net, dmod, now_ms) {
      return;
    }

    // the Send queue drains only while registered and otherwise idle
    let head = self.send_queue.head().map(|h| (h.records, h.format));
    if let Some((records, format)) = head {
      if !self.ensure_connected(net, queue_wake, now_ms) {
        return;
      }
      let records = records.unwrap_or(&[]);
      let mut opts = Options::new();
      if opts.add_str(num::URI_PATH, "dp").is_err() {
        return;
      }
      let request = crate::exchange::Request { code: Code::POST,
                                               opts,
                                               confirmable: true,
                                               token: None,
                                               observe_seq: None };
      match OutCtx::new(OutKind::Send, &UriPath::root(), records.len(), format) {
        | Ok(ctx) => {
          if self.begin(request, now_ms, net).is_ok() {
            self.send_ctx = Some(ctx);
            self.send_next_record = 0;
            self.send_record_open = false;
            self.send_queue.mark_in_flight();
            self.active = ActiveOp::Send;
          }
        },
        | Err(_) => {
          self.send_queue.mark_in_flight();
          self.send_queue.complete_in_flight(SendResult::Abort);
        },
      }
    }
  }

  fn preferred_bootstrap_format(&self) -> ContentFormat {
    #[cfg(feature = "senml-cbor")]
    {
      ContentFormat::SenmlCbor
    }
    #[cfg(not(feature = "senml-cbor"))]
    {
      ContentFormat::Lwm2mCbor
    }
  }

  fn begin(&mut self,
           request: crate::exchange::Request,
           now_ms: u64,
           net: &mut dyn Transport)
           -> Result<(), ExchangeError> {
    self.exchange
        .begin_client_request(request, net.inner_mtu(), now_ms)
  }

  fn pump_notifications(&mut self,
                        net: &mut dyn Transport,
                        dmod: &mut dyn DataModel,
                        now_ms: u64)
                        -> bool {
    let defaults = self.server_defaults(dmod);
    let queue_wake = self.registration.phase() == RegPhase::QueueMode;

    let mut due: Option<(Token, u32, bool, Option<f64>)> = None;
    let mut soonest: Option<u64> = None;
    for obs in self.observations.iter_mut() {
      let eff = self.attrs.effective(&obs.path, &defaults);
      let value = dm_value(dmod, &obs.path);
      match gate(obs, &eff, now_ms, value) {
        | NotifyVerdict::Due if due.is_none() => {
          let confirmable = eff.con.value().map(|con| con != 0).unwrap_or(false);
          due = Some((obs.token, obs.next_seq(), confirmable, value));
        },
        | NotifyVerdict::Due => {
          // another notification is already going out this step
          soonest = sooner_ms(soonest, Some(now_ms));
        },
        | NotifyVerdict::At(at) => soonest = sooner_ms(soonest, Some(at)),
        | NotifyVerdict::Idle => {},
      }
    }
    self.notify_deadline_ms = soonest;

    let Some((token, seq, mut confirmable, value)) = due else {
      return false;
    };
    if !self.ensure_connected(net, queue_wake, now_ms) {
      return true;
    }
    if let Some(iid) = self.server_iid(dmod) {
      if dm::read_bool(dmod,
                       &UriPath::resource(oid::SERVER, iid, server::DEFAULT_CON))
            .unwrap_or(false)
      {
        confirmable = true;
      }
    }

    let request = crate::exchange::Request { code: Code::CONTENT,
                                             opts: Options::new(),
                                             confirmable,
                                             token: Some(token),
                                             observe_seq: Some(seq) };
    if self.begin(request, now_ms, net).is_ok() {
      self.notify_skip = 0;
      self.active = ActiveOp::Notify { token, value };
    }
    true
  }

  fn server_defaults(&self, dmod: &dyn DataModel) -> Attributes {
    let mut defaults = Attributes::default();
    if let Some(iid) = self.server_iid(dmod) {
      if let Some(pmin) =
        dm::read_u32(dmod, &UriPath::resource(oid::SERVER, iid, server::DEFAULT_PMIN))
      {
        defaults.pmin = crate::observe::Attr::Set(pmin);
      }
      if let Some(pmax) =
        dm::read_u32(dmod, &UriPath::resource(oid::SERVER, iid, server::DEFAULT_PMAX))
      {
        if pmax > 0 {
          defaults.pmax = crate::observe::Attr::Set(pmax);
        }
      }
    }
    defaults
  }

  fn pump_exchange_out(&mut self, net: &mut dyn Transport, dmod: &mut dyn DataModel, now_ms: u64) {
    if self.exchange.state() != State::MsgToSend || self.wire_unsent {
      return;
    }
    if net.state() != TransportState::Connected {
      return;
    }

    // notify payload parameters are looked up before the field split
    let notify_target = match self.active {
      | ActiveOp::Notify { token, .. } => match self.observations.by_token(&token) {
        | Some(obs) => Some((obs.path, obs.format)),
        | None => {
          self.exchange.terminate();
          self.route_outcome(Outcome::Terminated, None, now_ms);
          return;
        },
      },
      | _ => None,
    };

    let mut payload_buf = [0u8; PAYLOAD_LEN];
    let filled = {
      let Client { exchange,
                   register_payload,
                   send_ctx,
                   send_queue,
                   send_next_record,
                   send_record_open,
                   notify_skip,
                   active,
                   send_buf,
                   .. } = self;
      match (*active, notify_target) {
        | (ActiveOp::Register | ActiveOp::Update { with_payload: true }, _) => {
          match register_payload.as_mut() {
            | Some(payload) => {
              let mut source = RegisterSource { payload,
                                                dm: dmod };
              exchange.fill(&mut source, &mut payload_buf, send_buf)
            },
            | None => Err(ExchangeError::Logic),
          }
        },
        | (ActiveOp::Send, _) => {
          let head = send_queue.head().map(|h| h.records);
          match (send_ctx.as_mut(), head) {
            | (Some(ctx), Some(records)) => {
              let mut source = SendSource { ctx,
                                            records: records.unwrap_or(&[]),
                                            next: send_next_record,
                                            record_open: send_record_open };
              exchange.fill(&mut source, &mut payload_buf, send_buf)
            },
            | _ => Err(ExchangeError::Logic),
          }
        },
        | (ActiveOp::Notify { .. }, Some((path, format))) => {
          let mut source = NotifySource { dm: dmod,
                                          path,
                                          format,
                                          skip: notify_skip };
          exchange.fill(&mut source, &mut payload_buf, send_buf)
        },
        | _ => exchange.fill(&mut NoPayload, &mut payload_buf, send_buf),
      }
    };

    match filled {
      | Ok(len) => {
        self.wire_len = len;
        self.wire_off = 0;
        self.wire_unsent = true;
      },
      | Err(e) => {
        warn!("could not build message: {:?}", e);
        self.exchange.terminate();
        self.route_outcome(Outcome::Terminated, None, now_ms);
      },
    }
  }

  // ---- exchange completion ------------------------------------------

  fn route_outcome(&mut self,
                   outcome: Outcome,
                   response: Option<&Inbound<'_>>,
                   now_ms: u64) {
    let active = core::mem::replace(&mut self.active, ActiveOp::None);
    self.register_payload = None;
    self.wire_unsent = false;

    match active {
      | ActiveOp::Register => {
        let event = self.registration
                        .on_result(RegRequest::Register, outcome, response,
                                   &self.config, now_ms);
        self.apply_reg_event(event);
      },
      | ActiveOp::Update { .. } => {
        let event = self.registration
                        .on_result(RegRequest::Update, outcome, response,
                                   &self.config, now_ms);
        self.apply_reg_event(event);
      },
      | ActiveOp::Deregister => {
        let event = self.registration
                        .on_result(RegRequest::Deregister, outcome, response,
                                   &self.config, now_ms);
        self.apply_reg_event(event);
      },
      | ActiveOp::BootstrapRequest => {
        self.bootstrap
            .on_request_result(outcome, response.map(|r| r.code), &self.config,
                               now_ms);
      },
      | ActiveOp::Send => {
        self.send_ctx = None;
        let result = match (outcome, response.map(|r| r.code)) {
          | (Outcome::Done, Some(code)) if code.is_error_response() => {
            SendResult::Rejected(code)
          },
          | (Outcome::Done, _) => SendResult::Success,
          | (Outcome::Timeout, _) => SendResult::Timeout,
          | _ => SendResult::Abort,
        };
        self.send_queue.complete_in_flight(result);
      },
      | ActiveOp::Notify { token, value } => {
        let failed = outcome != Outcome::Done
                     || response.map(|r| r.code.is_error_response())
                                .unwrap_or(false);
        if failed {
          // a dead observation invalidates the registration view
          warn!("notify failed, re-registering");
          self.observations.cancel(&token);
          self.registration.start();
        } else if let Some(obs) = self.observations.by_token(&token) {
          obs.last_sent_ms = now_ms;
          obs.last_value = value;
          obs.pending = false;
        }
      },
      | ActiveOp::None => {},
    }
  }

  fn apply_reg_event(&mut self, event: RegEvent) {
    match event {
      | RegEvent::Registered => {
        // a fresh registration voids previous observations
        self.observations.clear();
      },
      | RegEvent::NeedBootstrap => {
        self.bootstrap_requested = true;
      },
      | RegEvent::Suspended | RegEvent::Failed | RegEvent::None => {},
    }
  }

  // ---- server-initiated operations ----------------------------------

  fn queue_empty_ack(&mut self, msg_id: newt_msg::Id) {
    let ack = udp::Datagram::empty_ack(msg_id);
    if let Ok(n) = udp::encode(&ack, &mut self.resp_buf) {
      self.resp_len = n;
      self.resp_off = 0;
    }
  }

  fn queue_reset(&mut self, msg_id: newt_msg::Id) {
    let reset = udp::Datagram::reset(msg_id);
    if let Ok(n) = udp::encode(&reset, &mut self.resp_buf) {
      self.resp_len = n;
      self.resp_off = 0;
    }
  }

  fn handle_server_message(&mut self,
                           inbound: &Inbound<'_>,
                           dmod: &mut dyn DataModel,
                           now_ms: u64) {
    if self.bootstrap.is_active() {
      self.bootstrap.on_server_activity(&self.config, now_ms);
    }

    match inbound.op {
      | Operation::CoapPing => {
        self.queue_reset(inbound.msg_id);
        self.touch(now_ms);
        return;
      },
      | Operation::CoapReset | Operation::CoapEmpty | Operation::Response => {
        // stale or duplicated traffic
        return;
      },
      | _ => {},
    }

    let result = self.perform_server_op(inbound, dmod, now_ms);
    let mut response = Message::new(match &result {
                                      | Ok(r) => r.code,
                                      | Err(code) => *code,
                                    });
    response.token = inbound.token;

    let mut payload_len = 0;
    let mut payload_buf = [0u8; PAYLOAD_LEN];
    if let Ok(done) = &result {
      for (n, value) in done.opts.iter() {
        let _ = response.opts.add_bytes(n, value);
      }
      payload_len = done.payload_len.min(PAYLOAD_LEN);
      payload_buf[..payload_len].copy_from_slice(&done.payload[..payload_len]);
    }
    response.payload = &payload_buf[..payload_len];

    // NonConfirmable requests get a NonConfirmable reply
    let ty = if inbound.ty == Type::Non { Type::Non } else { Type::Ack };
    let datagram = udp::Datagram::new(ty, inbound.msg_id, response);
    match udp::encode(&datagram, &mut self.resp_buf) {
      | Ok(n) => {
        self.resp_len = n;
        self.resp_off = 0;
      },
      | Err(e) => warn!("response encode failed: {:?}", e),
    }
    self.touch(now_ms);
  }

  fn perform_server_op(&mut self,
                       inbound: &Inbound<'_>,
                       dmod: &mut dyn DataModel,
                       now_ms: u64)
                       -> Result<ServerOpDone, Code> {
    match inbound.op {
      | Operation::Read => self.do_read(inbound, dmod, OutKind::Read, None),
      | Operation::ObserveStart => self.do_observe_start(inbound, dmod, now_ms),
      | Operation::ObserveCancel => self.do_observe_cancel(inbound, dmod),
      | Operation::Discover => self.do_discover(inbound, dmod),
      | Operation::WriteReplace
      | Operation::WritePartial
      | Operation::Create => self.do_write(inbound, dmod),
      | Operation::WriteAttributes => self.do_write_attributes(inbound),
      | Operation::Execute => self.do_execute(inbound, dmod, now_ms),
      | Operation::Delete => {
        dmod.delete(&inbound.path).map_err(|e| e.code())?;
        self.registration.data_model_changed();
        Ok(ServerOpDone::code(Code::DELETED))
      },
      | Operation::BootstrapFinish => self.do_bootstrap_finish(dmod, now_ms),
      // composite operations are not part of this client's surface
      | Operation::ReadComposite
      | Operation::WriteComposite
      | Operation::ObserveCompositeStart
      | Operation::ObserveCompositeCancel => Err(Code::NOT_IMPLEMENTED),
      | _ => Err(Code::BAD_REQUEST),
    }
  }

  fn do_read(&mut self,
             inbound: &Inbound<'_>,
             dmod: &dyn DataModel,
             kind: OutKind,
             observe_seq: Option<u32>)
             -> Result<ServerOpDone, Code> {
    if count_records(dmod, &inbound.path) == 0 && inbound.path.has(Level::Resource)
    {
      return Err(Code::NOT_FOUND);
    }

    let block_size = inbound.block
                            .map(|(_, b)| b.size)
                            .unwrap_or(1024);
    let block_num = match inbound.block {
      | Some((BlockKind::Block2, b)) => b.num,
      | _ => 0,
    };
    let skip = block_num as usize * usize::from(block_size);

    let mut done = ServerOpDone::code(Code::CONTENT);
    let (len, format, more) =
      render_read_payload(dmod, &inbound.path, kind, inbound.accept, skip,
                          &mut done.payload[..usize::from(block_size)])
        .map_err(io_error_code)?;
    done.payload_len = len;

    if let Some(seq) = observe_seq {
      let _ = done.opts.add_u32(num::OBSERVE, seq);
    }
    let _ = done.opts.add_u16(num::CONTENT_FORMAT, format.into());
    if more || block_num > 0 {
      let block = Block { num: block_num,
                          more,
                          size: block_size };
      let _ = block.encode(BlockKind::Block2, &mut done.opts);
    }
    Ok(done)
  }

  fn do_observe_start(&mut self,
                      inbound: &Inbound<'_>,
                      dmod: &dyn DataModel,
                      now_ms: u64)
                      -> Result<ServerOpDone, Code> {
    let value = dm_value(dmod, &inbound.path);
    self.observations
        .observe(inbound.token, inbound.path, inbound.accept, now_ms, value)
        .map_err(|_| Code::INTERNAL_SERVER_ERROR)?;
    if self.attrs.write(&inbound.path, &inbound.attrs).is_err() {
      debug!("attribute table full, observation keeps defaults");
    }
    self.do_read(inbound, dmod, OutKind::Read, Some(0))
  }

  fn do_observe_cancel(&mut self,
                       inbound: &Inbound<'_>,
                       dmod: &dyn DataModel)
                       -> Result<ServerOpDone, Code> {
    self.observations.cancel(&inbound.token);
    self.do_read(inbound, dmod, OutKind::Read, None)
  }

  fn do_discover(&mut self,
                 inbound: &Inbound<'_>,
                 dmod: &dyn DataModel)
                 -> Result<ServerOpDone, Code> {
    let target_oid = inbound.path.oid().ok_or(Code::BAD_REQUEST)?;
    let known = (0..dmod.object_count()).filter_map(|i| dmod.object(i))
                                        .any(|o| o.oid == target_oid);
    if !known {
      return Err(Code::NOT_FOUND);
    }
    let depth = inbound.attrs.depth.value().map(|d| d.min(3) as u8);
    let attrs = self.attrs.at(&inbound.path);
    let mut payload = DiscoverPayload::new(inbound.path, depth, attrs);
    let mut done = ServerOpDone::code(Code::CONTENT);
    let (len, more) = payload.get_payload(dmod, &mut done.payload)
                             .map_err(io_error_code)?;
    if more {
      return Err(Code::REQUEST_ENTITY_TOO_LARGE);
    }
    done.payload_len = len;
    let _ = done.opts
                .add_u16(num::CONTENT_FORMAT, ContentFormat::LinkFormat.into());
    Ok(done)
  }

  fn do_write_attributes(&mut self, inbound: &Inbound<'_>) -> Result<ServerOpDone, Code> {
    let attrs = inbound.attrs;
    if let (Some(pmin), Some(pmax)) = (attrs.pmin.value(), attrs.pmax.value()) {
      if pmin > pmax {
        return Err(Code::BAD_REQUEST);
      }
    }
    self.attrs
        .write(&inbound.path, &attrs)
        .map_err(|_| Code::INTERNAL_SERVER_ERROR)?;
    Ok(ServerOpDone::code(Code::CHANGED))
  }

  fn do_execute(&mut self,
                inbound: &Inbound<'_>,
                dmod: &mut dyn DataModel,
                _now_ms: u64)
                -> Result<ServerOpDone, Code> {
    dmod.execute(&inbound.path, inbound.payload)
        .map_err(|e| e.code())?;

    // the Server object's executable resources drive the session
    if inbound.path.oid() == Some(oid::SERVER) {
      match inbound.path.rid() {
        | Some(server::DISABLE) => {
          let timeout = inbound.path
                               .iid()
                               .and_then(|iid| {
                                 dm::read_u32(dmod,
                                              &UriPath::resource(oid::SERVER, iid,
                                                                 server::DISABLE_TIMEOUT))
                               })
                               .unwrap_or(86_400);
          self.registration.set_disable_timeout(timeout);
          self.registration.disable();
        },
        | Some(server::UPDATE_TRIGGER) => self.registration.trigger_update(),
        | Some(server::BOOTSTRAP_TRIGGER) => self.bootstrap_requested = true,
        | _ => {},
      }
    }
    Ok(ServerOpDone::code(Code::CHANGED))
  }

  fn do_write(&mut self,
              inbound: &Inbound<'_>,
              dmod: &mut dyn DataModel)
              -> Result<ServerOpDone, Code> {
    let format = inbound.content_format.ok_or(Code::BAD_REQUEST)?;

    let (mut write, last) = match inbound.block {
      | Some((BlockKind::Block1, b)) => {
        if b.num == 0 {
          (self.new_server_write(inbound, dmod, format)?, !b.more)
        } else {
          let write = self.server_write
                          .take()
                          .filter(|w| w.next_block == b.num && w.op == inbound.op)
                          .ok_or(Code::REQUEST_ENTITY_INCOMPLETE)?;
          (write, !b.more)
        }
      },
      | _ => (self.new_server_write(inbound, dmod, format)?, true),
    };

    let mut chunk = Chunk::new(inbound.payload, last);
    loop {
      match write.ctx.get_entry(&mut chunk) {
        // mid-value block boundary: resume with the next Block1
        | Err(nb::Error::WouldBlock) => break,
        | Err(nb::Error::Other(_)) => return Err(Code::BAD_REQUEST),
        | Ok(None) => break,
        | Ok(Some(entry)) => {
          let Some(path) = entry.path else {
            // byte-value pieces that precede the record's name have
            // no target to apply to
            return Err(Code::NOT_IMPLEMENTED);
          };
          let path = match write.created_iid {
            | Some(iid) if path.iid() != Some(iid) => {
              rebase_to_instance(&path, iid)
            },
            | _ => path,
          };
          if let Some(value) = entry.value {
            self.apply_one_write(&path, &value, dmod)?;
          }
        },
      }
    }

    if !last {
      write.next_block += 1;
      let mut done = ServerOpDone::code(Code::CONTINUE);
      if let Some((BlockKind::Block1, b)) = inbound.block {
        let _ = b.encode(BlockKind::Block1, &mut done.opts);
      }
      self.server_write = Some(write);
      return Ok(done);
    }

    self.observations.mark_changed(&write.path);
    if write.op == Operation::Create {
      self.registration.data_model_changed();
      let mut done = ServerOpDone::code(Code::CREATED);
      if let (Some(oid), Some(iid)) = (write.path.oid(), write.created_iid) {
        let mut seg = crate::strbuf::StrBuf::<8>::new();
        use core::fmt::Write as _;
        let _ = write!(seg, "{}", oid);
        let _ = done.opts.add_str(num::LOCATION_PATH, &seg);
        seg.clear();
        let _ = write!(seg, "{}", iid);
        let _ = done.opts.add_str(num::LOCATION_PATH, &seg);
      }
      return Ok(done);
    }
    Ok(ServerOpDone::code(Code::CHANGED))
  }

  fn new_server_write(&mut self,
                      inbound: &Inbound<'_>,
                      dmod: &mut dyn DataModel,
                      format: ContentFormat)
                      -> Result<ServerWrite, Code> {
    let created_iid = if inbound.op == Operation::Create {
      let oid = inbound.path.oid().ok_or(Code::BAD_REQUEST)?;
      Some(dmod.create(oid, None).map_err(|e| e.code())?)
    } else {
      None
    };
    let ctx = InCtx::new(InKind::Write, &inbound.path, format)
      .map_err(io_error_code)?;
    Ok(ServerWrite { ctx,
                     op: inbound.op,
                     path: inbound.path,
                     next_block: 1,
                     created_iid })
  }

  fn apply_one_write(&mut self,
                     path: &UriPath,
                     value: &InValue<'_>,
                     dmod: &mut dyn DataModel)
                     -> Result<(), Code> {
    dmod.write(path, value).map_err(|e| e.code())?;

    // session-relevant Server resources
    if path.oid() == Some(oid::SERVER) {
      match path.rid() {
        | Some(server::LIFETIME) => {
          if let InValue::Number(n) = value {
            if let Ok(lifetime) = n.as_i64(false) {
              if (0..=i64::from(u32::MAX)).contains(&lifetime) {
                self.registration.lifetime_changed(lifetime as u32);
              }
            }
          }
        },
        | Some(server::BINDING) => self.registration.binding_changed(),
        | _ => {},
      }
    }
    Ok(())
  }

  fn do_bootstrap_finish(&mut self,
                         dmod: &dyn DataModel,
                         now_ms: u64)
                         -> Result<ServerOpDone, Code> {
    let valid = bootstrap_data_valid(dmod);
    self.bootstrap.on_finish(valid, &self.config, now_ms);
    if valid {
      Ok(ServerOpDone::code(Code::CHANGED))
    } else {
      Err(Code::NOT_ACCEPTABLE)
    }
  }

  // ---- deadlines ----------------------------------------------------

  fn deadline(&self, now_ms: u64) -> Option<u64> {
    let mut deadline = self.exchange.deadline_ms();
    deadline = sooner_ms(deadline, self.registration.deadline_ms());
    deadline = sooner_ms(deadline, self.bootstrap.deadline_ms());
    deadline = sooner_ms(deadline, self.notify_deadline_ms);
    if self.wire_unsent || self.resp_len > 0 || self.exchange.state() == State::MsgToSend
    {
      deadline = Some(now_ms);
    }
    deadline
  }
}

fn dm_value(dmod: &dyn DataModel, path: &UriPath) -> Option<f64> {
  dmod.read(path).ok().as_ref().and_then(value_as_f64)
}

fn rebase_to_instance(path: &UriPath, iid: u16) -> UriPath {
  match (path.oid(), path.rid(), path.riid()) {
    | (Some(oid), Some(rid), Some(riid)) => {
      UriPath::resource_instance(oid, iid, rid, riid)
    },
    | (Some(oid), Some(rid), None) => UriPath::resource(oid, iid, rid),
    | _ => *path,
  }
}

fn io_error_code(e: IoError) -> Code {
  match e {
    | IoError::UnsupportedFormat => Code::UNSUPPORTED_CONTENT_FORMAT,
    | IoError::Format => Code::BAD_REQUEST,
    | _ => Code::INTERNAL_SERVER_ERROR,
  }
}

/// One response to a server-initiated request
struct ServerOpDone {
  code: Code,
  opts: Options,
  payload: [u8; PAYLOAD_LEN],
  payload_len: usize,
}

impl ServerOpDone {
  fn code(code: Code) -> Self {
    ServerOpDone { code,
                   opts: Options::new(),
                   payload: [0; PAYLOAD_LEN],
                   payload_len: 0 }
  }
}

impl core::fmt::Debug for ServerOpDone {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("ServerOpDone")
     .field("code", &self.code)
     .field("payload_len", &self.payload_len)
     .finish()
  }
}
