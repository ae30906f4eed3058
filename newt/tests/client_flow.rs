//! End-to-end client scenarios over a scripted transport: the wire
//! bytes are decoded and checked the way a conformance harness would.

use newt::config::Config;
use newt::io::{OutCtx, OutKind};
use newt::observe::Attr;
use newt::path::UriPath;
use newt::session::register::Phase;
use newt::test::{test_addr, MockSocket, Stored, TestDm, TestInstance,
                 TestObject, TestResource};
use newt::value::{OutRecord, OutValue};
use newt::Client;
use newt_msg::opt::{num, observe::Observe, Options};
use newt_msg::{udp, Block, BlockKind, Code, ContentFormat, Id, Message, Token,
               Type};

fn config(lifetime: u32) -> Config {
  let mut config = Config::new("name").unwrap();
  config.lifetime = lifetime;
  config
}

// an owned view of one sent datagram, so tests can keep it around
// while feeding the mock socket
#[derive(Debug, Clone)]
struct Sent {
  ty: Type,
  id: Id,
  code: Code,
  token: Token,
  paths: Vec<String>,
  queries: Vec<String>,
  content_format: Option<ContentFormat>,
  observe: Option<u32>,
  block: Option<(BlockKind, Block)>,
  payload: Vec<u8>,
}

fn parse(raw: &[u8]) -> Sent {
  let d = udp::decode(raw).unwrap();
  Sent { ty: d.ty,
         id: d.id,
         code: d.msg.code,
         token: d.msg.token,
         paths: d.msg
                 .opts
                 .get_all(num::URI_PATH)
                 .map(|s| String::from_utf8(s.to_vec()).unwrap())
                 .collect(),
         queries: d.msg
                   .opts
                   .get_all(num::URI_QUERY)
                   .map(|s| String::from_utf8(s.to_vec()).unwrap())
                   .collect(),
         content_format: d.msg.content_format().unwrap(),
         observe: d.msg.opts.get_u32(num::OBSERVE).unwrap(),
         block: Block::decode(&d.msg.opts).unwrap(),
         payload: d.msg.payload.to_vec() }
}

fn last(net: &MockSocket) -> Sent {
  parse(net.last_sent())
}

fn encode(datagram: &udp::Datagram<'_>) -> Vec<u8> {
  let mut buf = [0u8; 1280];
  let n = udp::encode(datagram, &mut buf).unwrap();
  buf[..n].to_vec()
}

fn ack(to: &Sent, code: Code) -> Vec<u8> {
  let mut msg = Message::new(code);
  msg.token = to.token;
  encode(&udp::Datagram::new(Type::Ack, to.id, msg))
}

fn created_at(to: &Sent, segments: &[&str]) -> Vec<u8> {
  let mut msg = Message::new(Code::CREATED);
  msg.token = to.token;
  for seg in segments {
    msg.opts.add_str(num::LOCATION_PATH, seg).unwrap();
  }
  encode(&udp::Datagram::new(Type::Ack, to.id, msg))
}

fn register(client: &mut Client<'_>,
            net: &mut MockSocket,
            dm: &mut TestDm,
            now_ms: u64)
            -> u64 {
  client.step(now_ms, net, dm);
  let request = last(net);
  net.push_rx(&created_at(&request, &["rd", "1"]));
  client.step(now_ms + 10, net, dm);
  assert_eq!(client.registration_phase(), Phase::Registered);
  now_ms + 10
}

#[test]
fn register_update_deregister_happy_path() {
  let mut dm = TestDm::default();
  let mut net = MockSocket::new();
  let mut client = Client::new(config(150), test_addr(), None);

  client.step(0, &mut net, &mut dm);
  assert_eq!(net.sent.len(), 1);
  let request = last(&net);
  assert_eq!(request.code, Code::POST);
  assert_eq!(request.ty, Type::Con);
  assert_eq!(request.paths, ["rd"]);
  assert_eq!(request.queries, ["ep=name", "lt=150", "lwm2m=1.2", "b=U"]);
  assert_eq!(request.content_format, Some(ContentFormat::LinkFormat));
  assert_eq!(request.payload, b"</1>;ver=1.2,</1/1>,</3>,</3/0>");

  net.push_rx(&created_at(&request, &["rd", "5a3f"]));
  client.step(100, &mut net, &mut dm);
  assert_eq!(client.registration_phase(), Phase::Registered);

  // nothing to do before the update margin (lifetime/2 = 75 s)
  client.step(60_000, &mut net, &mut dm);
  assert_eq!(net.sent.len(), 1);

  client.step(76_000, &mut net, &mut dm);
  assert_eq!(net.sent.len(), 2);
  let update = last(&net);
  assert_eq!(update.code, Code::POST);
  assert_eq!(update.paths, ["rd", "5a3f"]);
  assert!(update.queries.is_empty());
  assert!(update.payload.is_empty());

  net.push_rx(&ack(&update, Code::CHANGED));
  client.step(76_100, &mut net, &mut dm);
  assert_eq!(client.registration_phase(), Phase::Registered);

  // the server disables us for 5 seconds
  let mut disable = Message::new(Code::POST);
  disable.token = Token::opaque(&[0x51]);
  disable.add_uri_path("1").unwrap();
  disable.add_uri_path("1").unwrap();
  disable.add_uri_path("4").unwrap();
  net.push_rx(&encode(&udp::Datagram::new(Type::Con, Id(0x9001), disable)));

  client.step(80_000, &mut net, &mut dm);
  // the 2.04 response and the Deregister both went out
  let n = net.sent.len();
  assert!(n >= 4);
  let exec_resp = parse(&net.sent[n - 2]);
  assert_eq!((exec_resp.code, exec_resp.id), (Code::CHANGED, Id(0x9001)));
  let deregister = parse(&net.sent[n - 1]);
  assert_eq!(deregister.code, Code::DELETE);
  assert_eq!(deregister.paths, ["rd", "5a3f"]);

  net.push_rx(&ack(&deregister, Code::DELETED));
  client.step(80_200, &mut net, &mut dm);
  assert_eq!(client.registration_phase(), Phase::Suspended);

  // after the 5 s disable timeout the client re-registers
  client.step(86_000, &mut net, &mut dm);
  let reregister = last(&net);
  assert_eq!(reregister.code, Code::POST);
  assert_eq!(reregister.paths, ["rd"]);
}

#[test]
fn block_wise_register() {
  let mut dm = TestDm::default();
  // widen the payload well past one 64-byte block
  for oid in [1000u16, 1001, 1002, 1003, 1004, 1005, 1006] {
    dm.objects.push(TestObject { oid,
                                 version: None,
                                 instances: vec![TestInstance {
                                   iid: 0,
                                   resources: vec![TestResource {
                                     rid: 0,
                                     value: Stored::Int(1),
                                   }],
                                 }] });
  }

  let mut net = MockSocket::new();
  net.mtu = 240;
  let mut client = Client::new(config(150), test_addr(), None);

  client.step(0, &mut net, &mut dm);
  let first = last(&net);
  let (kind, block) = first.block.unwrap();
  assert_eq!(kind, BlockKind::Block1);
  assert_eq!((block.num, block.more, block.size), (0, true, 64));
  assert_eq!(first.payload.len(), 64);

  let mut full = first.payload.clone();

  // 2.31 Continue keeps the transfer going
  let mut cont = Message::new(Code::CONTINUE);
  cont.token = first.token;
  Block::new(0, true, 64).unwrap()
                         .encode(BlockKind::Block1, &mut cont.opts)
                         .unwrap();
  net.push_rx(&encode(&udp::Datagram::new(Type::Ack, first.id, cont)));
  client.step(100, &mut net, &mut dm);

  let second = last(&net);
  let (_, block2) = second.block.unwrap();
  assert_eq!(block2.num, 1);
  assert_eq!(second.token, first.token);
  assert_ne!(second.id, first.id);
  full.extend_from_slice(&second.payload);

  let mut rounds = 1u64;
  let mut current = second;
  loop {
    let (_, block) = current.block.unwrap();
    if !block.more {
      break;
    }
    let mut cont = Message::new(Code::CONTINUE);
    cont.token = current.token;
    Block::new(block.num, true, 64).unwrap()
                                   .encode(BlockKind::Block1, &mut cont.opts)
                                   .unwrap();
    net.push_rx(&encode(&udp::Datagram::new(Type::Ack, current.id, cont)));
    client.step(100 + rounds * 10, &mut net, &mut dm);
    current = last(&net);
    full.extend_from_slice(&current.payload);
    rounds += 1;
    assert!(rounds <= 32, "runaway block transfer");
  }

  assert!(String::from_utf8(full).unwrap().contains("</1000/0>"));

  let final_num = current.block.unwrap().1.num;
  let mut created = Message::new(Code::CREATED);
  created.token = current.token;
  created.opts.add_str(num::LOCATION_PATH, "rd").unwrap();
  created.opts.add_str(num::LOCATION_PATH, "x").unwrap();
  Block::new(final_num, false, 64).unwrap()
                                  .encode(BlockKind::Block1, &mut created.opts)
                                  .unwrap();
  net.push_rx(&encode(&udp::Datagram::new(Type::Ack, current.id, created)));
  client.step(1_000, &mut net, &mut dm);
  assert_eq!(client.registration_phase(), Phase::Registered);
}

#[test]
fn observation_pmin_pmax() {
  let mut dm = TestDm::default();
  dm.set(&UriPath::resource(3, 0, 9), Stored::Int(800));
  let mut net = MockSocket::new();
  let mut client = Client::new(config(86_400), test_addr(), None);
  register(&mut client, &mut net, &mut dm, 0);

  // Observe /3/0/9 with pmin=100, pmax=300
  let mut observe = Message::new(Code::GET);
  observe.token = Token::opaque(&[0xB1, 0xB2]);
  observe.add_uri_path("3").unwrap();
  observe.add_uri_path("0").unwrap();
  observe.add_uri_path("9").unwrap();
  observe.opts.add_bytes(num::OBSERVE, &[]).unwrap();
  observe.add_uri_query("pmin=100").unwrap();
  observe.add_uri_query("pmax=300").unwrap();
  net.push_rx(&encode(&udp::Datagram::new(Type::Con, Id(0x7001), observe)));

  client.step(1_000, &mut net, &mut dm);
  let initial = last(&net);
  assert_eq!(initial.code, Code::CONTENT);
  assert_eq!(initial.id, Id(0x7001));
  assert_eq!(initial.observe, Some(0));
  assert!(!initial.payload.is_empty());

  // a change inside pmin stays quiet
  dm.set(&UriPath::resource(3, 0, 9), Stored::Int(200));
  client.data_model_changed(&UriPath::resource(3, 0, 9));
  client.step(50_000, &mut net, &mut dm);
  let before = net.sent.len();
  client.step(90_000, &mut net, &mut dm);
  assert_eq!(net.sent.len(), before);

  // past pmin the change notifies with the next sequence number
  client.step(102_000, &mut net, &mut dm);
  assert_eq!(net.sent.len(), before + 1);
  let notify = last(&net);
  assert_eq!(notify.ty, Type::Non);
  assert_eq!(notify.token, Token::opaque(&[0xB1, 0xB2]));
  assert_eq!(notify.observe, Some(1));

  // no further change: pmax fires 300 s after the last notification
  client.step(300_000, &mut net, &mut dm);
  assert_eq!(net.sent.len(), before + 1);
  client.step(403_000, &mut net, &mut dm);
  assert_eq!(net.sent.len(), before + 2);
  assert_eq!(last(&net).observe, Some(2));
}

#[test]
fn queue_mode_sleeps_and_wakes() {
  let mut dm = TestDm::default();
  let mut net = MockSocket::new();
  let mut cfg = config(150);
  cfg.queue_mode = true;
  cfg.queue_mode_timeout = Some(embedded_time::duration::Milliseconds(50_000));
  let mut client = Client::new(cfg, test_addr(), None);
  register(&mut client, &mut net, &mut dm, 0);

  // idle past the queue timeout: socket closes, port retained
  client.step(55_000, &mut net, &mut dm);
  assert_eq!(client.registration_phase(), Phase::QueueMode);
  assert_eq!(net.closes, 1);

  // the update due at 75 s reopens from the same port
  client.step(80_000, &mut net, &mut dm);
  assert_eq!(net.reuses, 1);
  let update = last(&net);
  assert_eq!(update.code, Code::POST);
  assert_eq!(update.paths, ["rd", "1"]);

  net.push_rx(&ack(&update, Code::CHANGED));
  client.step(80_100, &mut net, &mut dm);
  assert_eq!(client.registration_phase(), Phase::Registered);
}

#[test]
fn send_during_queue_mode() {
  use core::cell::RefCell;

  use newt::send::{SendCompletion, SendId, SendResult};

  #[derive(Default)]
  struct Log(RefCell<Vec<(SendId, SendResult)>>);
  impl SendCompletion for Log {
    fn completed(&self, id: SendId, result: SendResult) {
      self.0.borrow_mut().push((id, result));
    }
  }

  let records = [OutRecord::new(UriPath::resource(3, 0, 9),
                                OutValue::Uint(42)),
                 OutRecord::new(UriPath::resource(3, 0, 17),
                                OutValue::Str("demo_device"))];
  let log = Log::default();

  let mut dm = TestDm::default();
  let mut net = MockSocket::new();
  let mut cfg = config(86_400);
  cfg.queue_mode = true;
  cfg.queue_mode_timeout = Some(embedded_time::duration::Milliseconds(50_000));
  let mut client = Client::new(cfg, test_addr(), None);
  register(&mut client, &mut net, &mut dm, 0);

  client.step(55_000, &mut net, &mut dm);
  assert_eq!(client.registration_phase(), Phase::QueueMode);

  let id = client.send(&dm, &records, Some(ContentFormat::SenmlCbor),
                       Some(&log))
                 .unwrap();
  assert_eq!(id, SendId(1));

  client.step(60_000, &mut net, &mut dm);
  assert_eq!(net.reuses, 1);
  let send = last(&net);
  assert_eq!(send.code, Code::POST);
  assert_eq!(send.paths, ["dp"]);
  assert_eq!(send.content_format, Some(ContentFormat::SenmlCbor));
  // [{0: "/3/0/9", 2: 42}, {0: "/3/0/17", 3: "demo_device"}]
  assert_eq!(send.payload[..2], [0x82, 0xA2]);

  net.push_rx(&ack(&send, Code::CHANGED));
  client.step(60_100, &mut net, &mut dm);
  assert_eq!(log.0.borrow().as_slice(),
             [(SendId(1), SendResult::Success)]);
  assert_eq!(client.registration_phase(), Phase::Registered);
}

fn senml_write_payload(base: UriPath, records: &[OutRecord<'_>]) -> Vec<u8> {
  let mut ctx = OutCtx::new(OutKind::Read, &base, records.len(),
                            Some(ContentFormat::SenmlCbor)).unwrap();
  let mut buf = [0u8; 256];
  let mut total = 0;
  for record in records {
    ctx.new_entry(*record).unwrap();
    loop {
      let (n, more) = ctx.get_payload(&mut buf[total..]).unwrap();
      total += n;
      if !more {
        break;
      }
    }
  }
  buf[..total].to_vec()
}

#[test]
fn bootstrap_with_retry() {
  let mut dm = TestDm::bootstrap_only();
  let mut net = MockSocket::new();
  net.fail_connects = 1;
  let mut client = Client::new(config(150), test_addr(), Some(test_addr()));

  // first connect fails; the session backs off
  client.step(0, &mut net, &mut dm);
  assert!(client.bootstrapping());
  assert!(net.sent.is_empty());

  // after bootstrap_retry_timeout the request goes out
  client.step(30_000, &mut net, &mut dm);
  let request = last(&net);
  assert_eq!(request.code, Code::POST);
  assert_eq!(request.paths, ["bs"]);
  assert_eq!(request.queries, ["ep=name", "pct=112"]);

  net.push_rx(&ack(&request, Code::CHANGED));
  client.step(30_100, &mut net, &mut dm);

  // the server provisions Security/1 and Server/2
  let security = senml_write_payload(UriPath::instance(0, 1),
                                     &[OutRecord::new(UriPath::resource(0, 1, 1),
                                                      OutValue::Bool(false)),
                                       OutRecord::new(UriPath::resource(0, 1, 10),
                                                      OutValue::Uint(2))]);
  let mut write = Message::new(Code::PUT);
  write.token = Token::opaque(&[0xC1]);
  write.add_uri_path("0").unwrap();
  write.add_uri_path("1").unwrap();
  write.opts
       .add_u16(num::CONTENT_FORMAT, ContentFormat::SenmlCbor.into())
       .unwrap();
  write.payload = &security;
  net.push_rx(&encode(&udp::Datagram::new(Type::Con, Id(0x6001), write)));
  client.step(31_000, &mut net, &mut dm);
  let resp = last(&net);
  assert_eq!((resp.code, resp.id), (Code::CHANGED, Id(0x6001)));

  let server_payload =
    senml_write_payload(UriPath::instance(1, 2),
                        &[OutRecord::new(UriPath::resource(1, 2, 0),
                                         OutValue::Uint(2)),
                          OutRecord::new(UriPath::resource(1, 2, 1),
                                         OutValue::Uint(300))]);
  let mut write = Message::new(Code::PUT);
  write.token = Token::opaque(&[0xC2]);
  write.add_uri_path("1").unwrap();
  write.add_uri_path("2").unwrap();
  write.opts
       .add_u16(num::CONTENT_FORMAT, ContentFormat::SenmlCbor.into())
       .unwrap();
  write.payload = &server_payload;
  net.push_rx(&encode(&udp::Datagram::new(Type::Con, Id(0x6002), write)));
  client.step(32_000, &mut net, &mut dm);

  // Bootstrap-Finish validates the provisioned pair
  let mut finish = Message::new(Code::POST);
  finish.token = Token::opaque(&[0xC3]);
  finish.add_uri_path("bs").unwrap();
  net.push_rx(&encode(&udp::Datagram::new(Type::Con, Id(0x6003), finish)));
  client.step(33_000, &mut net, &mut dm);
  let finish_resp = last(&net);
  assert_eq!((finish_resp.code, finish_resp.id),
             (Code::CHANGED, Id(0x6003)));

  // with credentials in place, registration starts
  client.step(34_000, &mut net, &mut dm);
  let register = last(&net);
  assert_eq!(register.code, Code::POST);
  assert_eq!(register.paths, ["rd"]);
  assert!(!client.bootstrapping());
}

#[test]
fn write_attributes_then_threshold_gating() {
  let mut dm = TestDm::default();
  dm.set(&UriPath::resource(3, 0, 9), Stored::Int(800));
  let mut net = MockSocket::new();
  let mut client = Client::new(config(86_400), test_addr(), None);
  register(&mut client, &mut net, &mut dm, 0);

  // Write-Attributes: gt=500 (PUT without Content-Format)
  let mut wattr = Message::new(Code::PUT);
  wattr.token = Token::opaque(&[0xD1]);
  wattr.add_uri_path("3").unwrap();
  wattr.add_uri_path("0").unwrap();
  wattr.add_uri_path("9").unwrap();
  wattr.add_uri_query("gt=500").unwrap();
  net.push_rx(&encode(&udp::Datagram::new(Type::Con, Id(0x8001), wattr)));
  client.step(1_000, &mut net, &mut dm);
  assert_eq!(last(&net).code, Code::CHANGED);

  // observe, then a change that does not cross gt stays quiet
  let mut observe = Message::new(Code::GET);
  observe.token = Token::opaque(&[0xD2]);
  observe.add_uri_path("3").unwrap();
  observe.add_uri_path("0").unwrap();
  observe.add_uri_path("9").unwrap();
  observe.opts.add_bytes(num::OBSERVE, &[]).unwrap();
  net.push_rx(&encode(&udp::Datagram::new(Type::Con, Id(0x8002), observe)));
  client.step(2_000, &mut net, &mut dm);
  let baseline = net.sent.len();

  dm.set(&UriPath::resource(3, 0, 9), Stored::Int(700));
  client.data_model_changed(&UriPath::resource(3, 0, 9));
  client.step(10_000, &mut net, &mut dm);
  assert_eq!(net.sent.len(), baseline);

  // crossing gt=500 downward notifies
  dm.set(&UriPath::resource(3, 0, 9), Stored::Int(200));
  client.data_model_changed(&UriPath::resource(3, 0, 9));
  client.step(20_000, &mut net, &mut dm);
  assert_eq!(net.sent.len(), baseline + 1);
  assert_eq!(last(&net).token, Token::opaque(&[0xD2]));
}

#[test]
fn observe_attributes_decode_cleanly() {
  // sanity-check the Attr plumbing the scenarios above rely on
  let mut opts = Options::new();
  opts.add_str(num::URI_QUERY, "pmin=100").unwrap();
  opts.add_str(num::URI_QUERY, "pmax=").unwrap();
  let attrs = newt::observe::Attributes::decode(&opts).unwrap();
  assert_eq!(attrs.pmin, Attr::Set(100));
  assert_eq!(attrs.pmax, Attr::Unset);
  assert_eq!(Observe::decode(&opts).unwrap(), None);
}
