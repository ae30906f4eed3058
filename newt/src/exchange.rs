//! The exchange engine: one outstanding CoAP transaction at a time.
//!
//! Every client-initiated message — Register, Update, Deregister,
//! Bootstrap-Request, Send, Notify — flows through here. The engine
//! owns the token and message-id for the life of the exchange, slices
//! pull-model payloads into Block1 transfers sized to the transport
//! MTU, follows Block2'd responses, and drives RFC 7252 retransmission
//! with exponential backoff.
//!
//! It never retries past the CoAP transmission counts; what to do
//! about a dead exchange is the owning session's policy.

use newt_msg::opt::num;
use newt_msg::{udp, Block, BlockKind, Code, ContentFormat, Id, Message, Options,
               Token, Type};
use rand::{Rng, SeedableRng};

use crate::config::Coap;
use crate::req::{Inbound, Operation};
use crate::retry::{RetryTimer, Verdict};
use crate::time::Millis;

/// Exchange-level errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeError {
  /// An exchange is already active (or none is)
  Logic,
  /// The send buffer cannot hold the message
  Buffer,
  /// A payload source misbehaved
  InputArg,
}

impl From<newt_msg::OptionsError> for ExchangeError {
  fn from(_: newt_msg::OptionsError) -> Self {
    ExchangeError::Buffer
  }
}

impl From<newt_msg::FrameError> for ExchangeError {
  fn from(_: newt_msg::FrameError) -> Self {
    ExchangeError::Buffer
  }
}

/// One pulled stretch of request payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadChunk {
  /// Bytes written into the offered buffer
  pub len: usize,
  /// The payload's content format (consulted on the first chunk)
  pub format: Option<ContentFormat>,
  /// More payload follows: emit this chunk as a block and come back
  pub more: bool,
}

/// The pull side of the payload contract (§block-wise): the engine
/// offers a block-sized buffer, the source fills it.
pub trait PayloadSource {
  /// Fill `buf` with the next stretch of payload
  fn pull(&mut self, buf: &mut [u8]) -> Result<PayloadChunk, ExchangeError>;
}

/// A source for requests that carry no payload
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPayload;

impl PayloadSource for NoPayload {
  fn pull(&mut self, _: &mut [u8]) -> Result<PayloadChunk, ExchangeError> {
    Ok(PayloadChunk { len: 0,
                      format: None,
                      more: false })
  }
}

/// Where the exchange stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
  /// No exchange active
  Idle,
  /// A message is ready to be built & sent
  MsgToSend,
  /// Sent; awaiting the peer
  WaitingMsg,
  /// Over; the result says how
  Finished(Outcome),
}

/// How an exchange ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
  /// The final response arrived (sessions saw it via
  /// [`Exchange::handle_inbound`])
  Done,
  /// Retransmissions exhausted
  Timeout,
  /// The peer Reset us
  Reset,
  /// [`Exchange::terminate`] was called
  Terminated,
}

/// What an inbound message meant to the active exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
  /// Not ours — likely a server-initiated request
  NotMine,
  /// 2.31 Continue: the next block is ready to go
  NextBlock,
  /// One block of a larger response; the engine will request the next
  ResponsePiece,
  /// The final response; the exchange is finished
  Complete,
  /// Separate-ACK: retransmission stops, the response comes later
  Acked,
}

/// What to do after a timer tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutAction {
  /// Send the previously built bytes again
  Resend,
  /// Nothing yet
  Wait,
  /// The exchange just finished with [`Outcome::Timeout`]
  GaveUp,
}

/// Smallest datagram overhead reserved next to the payload: header,
/// token, options worst case
const HEADER_OVERHEAD: usize = 4 + 8 + newt_msg::OPTS_BUFFER_LEN / 2;

/// The single-exchange engine. See the [module docs](self).
#[derive(Debug)]
pub struct Exchange {
  state: State,
  confirmable: bool,
  code: Code,
  token: Token,
  msg_id: Id,
  opts: Options,
  format: Option<ContentFormat>,
  observe_seq: Option<u32>,

  block_size: u16,
  tx_block: u32,
  tx_more: bool,
  rx_block: u32,
  rx_active: bool,

  retry: Option<RetryTimer>,
  started_ms: u64,
  separate_acked: bool,

  coap: Coap,
  next_msg_id: Id,
  rng: rand_chacha::ChaCha8Rng,
}

/// What to send, beyond code & options
#[derive(Debug)]
pub struct Request {
  /// Request code
  pub code: Code,
  /// Pre-built options (Uri-Path, Uri-Query, Observe…) — the engine
  /// adds Content-Format and block options itself
  pub opts: Options,
  /// Confirmable?
  pub confirmable: bool,
  /// Reuse this token (notifications); `None` mints a fresh one
  pub token: Option<Token>,
  /// Observe sequence number to carry (notifications)
  pub observe_seq: Option<u32>,
}

impl Exchange {
  /// An idle engine seeded with the process-wide randomness
  pub fn new(coap: Coap, seed: u32) -> Self {
    let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(u64::from(seed));
    let next_msg_id = Id(rng.gen());
    Exchange { state: State::Idle,
               confirmable: true,
               code: Code::EMPTY,
               token: Token::empty(),
               msg_id: Id(0),
               opts: Options::new(),
               format: None,
               observe_seq: None,
               block_size: 1024,
               tx_block: 0,
               tx_more: false,
               rx_block: 0,
               rx_active: false,
               retry: None,
               started_ms: 0,
               separate_acked: false,
               coap,
               next_msg_id,
               rng }
  }

  /// Where the exchange stands
  pub fn state(&self) -> State {
    self.state
  }

  /// Whether a transaction is in flight
  pub fn is_active(&self) -> bool {
    matches!(self.state, State::MsgToSend | State::WaitingMsg)
  }

  /// The token owned by the active exchange
  pub fn token(&self) -> Token {
    self.token
  }

  fn alloc_msg_id(&mut self) -> Id {
    let id = self.next_msg_id;
    self.next_msg_id = id.next();
    id
  }

  fn mint_token(&mut self) -> Token {
    let mut bytes = [0u8; 8];
    self.rng.fill(&mut bytes);
    Token::opaque(&bytes)
  }

  /// Begin a client-initiated exchange.
  ///
  /// `inner_mtu` bounds the block size. Fails with
  /// [`ExchangeError::Logic`] while another exchange is active.
  pub fn begin_client_request(&mut self,
                              req: Request,
                              inner_mtu: usize,
                              now_ms: u64)
                              -> Result<(), ExchangeError> {
    if self.is_active() {
      return Err(ExchangeError::Logic);
    }

    self.state = State::MsgToSend;
    self.confirmable = req.confirmable;
    self.code = req.code;
    self.opts = req.opts;
    self.observe_seq = req.observe_seq;
    self.token = match req.token {
      | Some(token) => token,
      | None => self.mint_token(),
    };
    self.msg_id = self.alloc_msg_id();
    self.format = None;
    self.block_size =
      Block::size_for_budget(inner_mtu.saturating_sub(HEADER_OVERHEAD));
    self.tx_block = 0;
    self.tx_more = false;
    self.rx_block = 0;
    self.rx_active = false;
    self.retry = None;
    self.separate_acked = false;
    self.started_ms = now_ms;
    Ok(())
  }

  /// Build the current message: payload into `payload_buf`, the whole
  /// datagram into `send_buf`. Yields the wire length.
  ///
  /// Call in [`State::MsgToSend`]; the same bytes are retransmitted
  /// verbatim, so the caller keeps `send_buf` until the exchange moves
  /// on.
  pub fn fill(&mut self,
              source: &mut dyn PayloadSource,
              payload_buf: &mut [u8],
              send_buf: &mut [u8])
              -> Result<usize, ExchangeError> {
    if self.state != State::MsgToSend {
      return Err(ExchangeError::Logic);
    }

    let budget = usize::from(self.block_size).min(payload_buf.len());
    let chunk = source.pull(&mut payload_buf[..budget])?;
    if self.format.is_none() {
      self.format = chunk.format;
    }
    self.tx_more = chunk.more;

    let mut msg = Message::new(self.code);
    msg.token = self.token;
    msg.opts = self.opts.clone();

    if let Some(seq) = self.observe_seq {
      msg.opts.add_u32(num::OBSERVE, seq)?;
    }
    if chunk.len > 0 {
      let format = self.format.ok_or(ExchangeError::InputArg)?;
      msg.opts.add_u16(num::CONTENT_FORMAT, format.into())?;
    }
    if chunk.more || self.tx_block > 0 {
      Block { num: self.tx_block,
              more: chunk.more,
              size: self.block_size }.encode(BlockKind::Block1, &mut msg.opts)?;
    }
    if self.rx_active {
      Block { num: self.rx_block,
              more: false,
              size: self.block_size }.encode(BlockKind::Block2, &mut msg.opts)?;
    }
    msg.payload = &payload_buf[..chunk.len];

    let ty = if self.confirmable { Type::Con } else { Type::Non };
    let len = udp::encode(&udp::Datagram::new(ty, self.msg_id, msg), send_buf)?;
    Ok(len)
  }

  /// The message built by [`Exchange::fill`] went out on the wire
  pub fn on_sent(&mut self, now_ms: u64) {
    match self.state {
      | State::MsgToSend if self.confirmable => {
        self.state = State::WaitingMsg;
        if self.retry.is_none() {
          self.retry = Some(RetryTimer::new(now_ms,
                                            self.coap.ack_timeout,
                                            self.coap.ack_random_factor_pct,
                                            self.coap.max_attempts,
                                            self.rng.gen()));
        }
      },
      | State::MsgToSend if self.tx_more => {
        // NonConfirmable block transfer: next block right away
        self.tx_block += 1;
        self.msg_id = self.alloc_msg_id();
      },
      | State::MsgToSend => {
        self.state = State::Finished(Outcome::Done);
      },
      | _ => {},
    }
  }

  /// Feed a recognized inbound message to the exchange.
  pub fn handle_inbound(&mut self, inbound: &Inbound<'_>) -> Disposition {
    if !matches!(self.state, State::WaitingMsg) {
      return Disposition::NotMine;
    }

    match inbound.op {
      | Operation::CoapReset if inbound.msg_id == self.msg_id => {
        self.state = State::Finished(Outcome::Reset);
        Disposition::Complete
      },
      | Operation::CoapEmpty if inbound.msg_id == self.msg_id => {
        // separate acknowledgement: the real response comes as a Con
        self.separate_acked = true;
        self.retry = None;
        Disposition::Acked
      },
      | Operation::Response if inbound.token == self.token => {
        if inbound.code == Code::CONTINUE {
          if !self.tx_more {
            self.state = State::Finished(Outcome::Done);
            return Disposition::Complete;
          }
          self.tx_block += 1;
          self.msg_id = self.alloc_msg_id();
          self.retry = None;
          self.state = State::MsgToSend;
          return Disposition::NextBlock;
        }

        if let Some((BlockKind::Block2 | BlockKind::Both, block)) = inbound.block {
          if block.more {
            self.rx_active = true;
            self.rx_block = block.num + 1;
            self.block_size = self.block_size.min(block.size);
            self.msg_id = self.alloc_msg_id();
            self.retry = None;
            self.state = State::MsgToSend;
            return Disposition::ResponsePiece;
          }
        }

        self.state = State::Finished(Outcome::Done);
        Disposition::Complete
      },
      | _ => Disposition::NotMine,
    }
  }

  /// Advance the retransmission clock.
  pub fn on_timeout(&mut self, now_ms: u64) -> TimeoutAction {
    if self.state != State::WaitingMsg || self.separate_acked {
      return TimeoutAction::Wait;
    }
    if now_ms.saturating_sub(self.started_ms) >= self.coap.max_transmit_wait.0 {
      self.state = State::Finished(Outcome::Timeout);
      return TimeoutAction::GaveUp;
    }
    match &mut self.retry {
      | Some(retry) => match retry.verdict(now_ms) {
        | Verdict::Retry => TimeoutAction::Resend,
        | Verdict::Wait => TimeoutAction::Wait,
        | Verdict::GiveUp => {
          self.state = State::Finished(Outcome::Timeout);
          TimeoutAction::GaveUp
        },
      },
      | None => TimeoutAction::Wait,
    }
  }

  /// When [`Exchange::on_timeout`] next wants a look
  pub fn deadline_ms(&self) -> Option<u64> {
    if self.state != State::WaitingMsg || self.separate_acked {
      return None;
    }
    let wait_end = self.started_ms.saturating_add(self.coap.max_transmit_wait.0);
    Some(match &self.retry {
           | Some(retry) => retry.deadline_ms().min(wait_end),
           | None => wait_end,
         })
  }

  /// Force-end the exchange
  pub fn terminate(&mut self) {
    if self.is_active() {
      self.state = State::Finished(Outcome::Terminated);
    }
  }

  /// Collect the outcome and return to [`State::Idle`]
  pub fn take_outcome(&mut self) -> Option<Outcome> {
    match self.state {
      | State::Finished(outcome) => {
        self.state = State::Idle;
        self.retry = None;
        Some(outcome)
      },
      | _ => None,
    }
  }

  /// Time an exchange may remain pending overall
  pub fn max_transmit_wait(&self) -> Millis {
    self.coap.max_transmit_wait
  }
}

#[cfg(test)]
mod tests {
  use embedded_time::duration::Milliseconds;

  use super::*;

  struct Blob<'a> {
    data: &'a [u8],
    at: usize,
  }

  impl PayloadSource for Blob<'_> {
    fn pull(&mut self, buf: &mut [u8]) -> Result<PayloadChunk, ExchangeError> {
      let n = (self.data.len() - self.at).min(buf.len());
      buf[..n].copy_from_slice(&self.data[self.at..self.at + n]);
      self.at += n;
      Ok(PayloadChunk { len: n,
                        format: Some(ContentFormat::LinkFormat),
                        more: self.at < self.data.len() })
    }
  }

  fn request(code: Code) -> Request {
    let mut opts = Options::new();
    opts.add_str(num::URI_PATH, "rd").unwrap();
    Request { code,
              opts,
              confirmable: true,
              token: None,
              observe_seq: None }
  }

  fn response(token: Token, code: Code) -> Inbound<'static> {
    Inbound { op: Operation::Response,
              ty: Type::Ack,
              msg_id: Id(0),
              code,
              token,
              path: crate::path::UriPath::root(),
              content_format: None,
              accept: None,
              block: None,
              attrs: Default::default(),
              location: Default::default(),
              etag: None,
              payload: &[] }
  }

  #[test]
  fn one_exchange_at_a_time() {
    let mut ex = Exchange::new(Coap::default(), 1);
    ex.begin_client_request(request(Code::POST), 1152, 0).unwrap();
    assert_eq!(ex.begin_client_request(request(Code::POST), 1152, 0),
               Err(ExchangeError::Logic));
  }

  #[test]
  fn confirmable_lifecycle() {
    let mut ex = Exchange::new(Coap::default(), 1);
    ex.begin_client_request(request(Code::POST), 1152, 0).unwrap();

    let mut payload = [0u8; 1024];
    let mut wire = [0u8; 1280];
    let n = ex.fill(&mut NoPayload, &mut payload, &mut wire).unwrap();
    assert!(n >= 4);
    ex.on_sent(0);
    assert_eq!(ex.state(), State::WaitingMsg);

    let inbound = response(ex.token(), Code::CREATED);
    assert_eq!(ex.handle_inbound(&inbound), Disposition::Complete);
    assert_eq!(ex.take_outcome(), Some(Outcome::Done));
    assert_eq!(ex.state(), State::Idle);
  }

  #[test]
  fn token_mismatch_is_not_ours() {
    let mut ex = Exchange::new(Coap::default(), 1);
    ex.begin_client_request(request(Code::POST), 1152, 0).unwrap();
    let mut payload = [0u8; 64];
    let mut wire = [0u8; 256];
    ex.fill(&mut NoPayload, &mut payload, &mut wire).unwrap();
    ex.on_sent(0);

    let inbound = response(Token::opaque(&[9; 8]), Code::CREATED);
    assert_eq!(ex.handle_inbound(&inbound), Disposition::NotMine);
    assert!(ex.is_active());
  }

  #[test]
  fn retransmits_then_gives_up() {
    let mut ex = Exchange::new(Coap { ack_timeout: Milliseconds(2_000),
                                      ack_random_factor_pct: 100,
                                      max_attempts: crate::retry::Attempts(3),
                                      max_transmit_wait: Milliseconds(93_000) },
                               1);
    ex.begin_client_request(request(Code::POST), 1152, 0).unwrap();
    let mut payload = [0u8; 64];
    let mut wire = [0u8; 256];
    ex.fill(&mut NoPayload, &mut payload, &mut wire).unwrap();
    ex.on_sent(0);

    assert_eq!(ex.on_timeout(1_000), TimeoutAction::Wait);
    assert_eq!(ex.on_timeout(2_000), TimeoutAction::Resend);
    assert_eq!(ex.on_timeout(5_999), TimeoutAction::Wait);
    assert_eq!(ex.on_timeout(6_000), TimeoutAction::Resend);
    assert_eq!(ex.on_timeout(14_000), TimeoutAction::GaveUp);
    assert_eq!(ex.take_outcome(), Some(Outcome::Timeout));
  }

  #[test]
  fn max_transmit_wait_bounds_the_exchange() {
    let mut ex = Exchange::new(Coap::default(), 1);
    ex.begin_client_request(request(Code::POST), 1152, 0).unwrap();
    let mut payload = [0u8; 64];
    let mut wire = [0u8; 256];
    ex.fill(&mut NoPayload, &mut payload, &mut wire).unwrap();
    ex.on_sent(0);
    assert_eq!(ex.on_timeout(93_000), TimeoutAction::GaveUp);
  }

  #[test]
  fn block1_walk() {
    let data = [7u8; 100];
    let mut source = Blob { data: &data,
                            at: 0 };
    // inner_mtu small enough to force 64-byte blocks
    let mut ex = Exchange::new(Coap::default(), 1);
    ex.begin_client_request(request(Code::POST), 64 + HEADER_OVERHEAD, 0)
      .unwrap();

    let mut payload = [0u8; 1024];
    let mut wire = [0u8; 1280];
    let n = ex.fill(&mut source, &mut payload, &mut wire).unwrap();
    let first = udp::decode(&wire[..n]).unwrap();
    let (kind, block) = Block::decode(&first.msg.opts).unwrap().unwrap();
    assert_eq!(kind, BlockKind::Block1);
    assert_eq!((block.num, block.more, block.size), (0, true, 64));
    assert_eq!(first.msg.payload.len(), 64);
    ex.on_sent(0);

    let mut cont = response(ex.token(), Code::CONTINUE);
    cont.block = Some((BlockKind::Block1,
                       Block::new(0, true, 64).unwrap()));
    assert_eq!(ex.handle_inbound(&cont), Disposition::NextBlock);
    assert_eq!(ex.state(), State::MsgToSend);

    let n = ex.fill(&mut source, &mut payload, &mut wire).unwrap();
    let second = udp::decode(&wire[..n]).unwrap();
    let (_, block) = Block::decode(&second.msg.opts).unwrap().unwrap();
    assert_eq!((block.num, block.more), (1, false));
    assert_eq!(second.msg.payload.len(), 36);
    assert_ne!(second.id, first.id);
    assert_eq!(second.msg.token, first.msg.token);
    ex.on_sent(1);

    let done = response(ex.token(), Code::CREATED);
    assert_eq!(ex.handle_inbound(&done), Disposition::Complete);
  }

  #[test]
  fn block2_response_walk() {
    let mut ex = Exchange::new(Coap::default(), 1);
    ex.begin_client_request(request(Code::GET), 1152, 0).unwrap();
    let mut payload = [0u8; 64];
    let mut wire = [0u8; 1280];
    ex.fill(&mut NoPayload, &mut payload, &mut wire).unwrap();
    ex.on_sent(0);

    let mut piece = response(ex.token(), Code::CONTENT);
    piece.block = Some((BlockKind::Block2,
                        Block::new(0, true, 512).unwrap()));
    assert_eq!(ex.handle_inbound(&piece), Disposition::ResponsePiece);

    let n = ex.fill(&mut NoPayload, &mut payload, &mut wire).unwrap();
    let follow_up = udp::decode(&wire[..n]).unwrap();
    let (kind, block) = Block::decode(&follow_up.msg.opts).unwrap().unwrap();
    assert_eq!(kind, BlockKind::Block2);
    assert_eq!((block.num, block.size), (1, 512));
    ex.on_sent(1);

    let mut last = response(ex.token(), Code::CONTENT);
    last.block = Some((BlockKind::Block2,
                       Block::new(1, false, 512).unwrap()));
    assert_eq!(ex.handle_inbound(&last), Disposition::Complete);
  }

  #[test]
  fn separate_ack_stops_retransmission() {
    let mut ex = Exchange::new(Coap::default(), 1);
    ex.begin_client_request(request(Code::POST), 1152, 0).unwrap();
    let mut payload = [0u8; 64];
    let mut wire = [0u8; 256];
    ex.fill(&mut NoPayload, &mut payload, &mut wire).unwrap();
    ex.on_sent(0);

    let ack = Inbound { op: Operation::CoapEmpty,
                        msg_id: ex.msg_id,
                        ..response(Token::empty(), Code::EMPTY) };
    assert_eq!(ex.handle_inbound(&ack), Disposition::Acked);
    assert_eq!(ex.on_timeout(90_000), TimeoutAction::Wait);
    assert_eq!(ex.deadline_ms(), None);

    let late = response(ex.token(), Code::CHANGED);
    assert_eq!(ex.handle_inbound(&late), Disposition::Complete);
  }

  #[test]
  fn terminate_from_any_active_state() {
    let mut ex = Exchange::new(Coap::default(), 1);
    ex.begin_client_request(request(Code::POST), 1152, 0).unwrap();
    ex.terminate();
    assert_eq!(ex.take_outcome(), Some(Outcome::Terminated));
    // idle terminate is a no-op
    ex.terminate();
    assert_eq!(ex.take_outcome(), None);
  }
}
