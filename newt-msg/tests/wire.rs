//! Bit-exact wire vectors for the message shapes an LwM2M client
//! actually produces, plus round-trip properties.

use newt_msg::opt::num;
use newt_msg::{tcp, udp, Code, ContentFormat, FrameError, Id, Message, Options,
               Token, Type};

fn register_msg() -> Message<'static> {
  let mut msg = Message::new(Code::POST);
  msg.token = Token::opaque(&[0xA0, 0xA1, 0xA2, 0xA3, 0xA4, 0xA5, 0xA6, 0xA7]);
  msg.add_uri_path("rd").unwrap();
  msg.opts
     .add_u16(num::CONTENT_FORMAT, ContentFormat::LinkFormat.into())
     .unwrap();
  msg.add_uri_query("ep=name").unwrap();
  msg.add_uri_query("lt=120").unwrap();
  msg.add_uri_query("lwm2m=1.2").unwrap();
  msg.add_uri_query("Q").unwrap();
  msg.payload = b"<1/1>";
  msg
}

#[test]
fn register_request_bytes() {
  let d = udp::Datagram::new(Type::Con, Id(1), register_msg());
  let mut buf = [0u8; 100];
  let n = udp::encode(&d, &mut buf).unwrap();

  let expected: &[u8] = &[
    0x48, // Con, tkl 8
    0x02, 0x00, 0x01, // POST, id 1
    0xA0, 0xA1, 0xA2, 0xA3, 0xA4, 0xA5, 0xA6, 0xA7, // token
    0xB2, b'r', b'd', // Uri-Path "rd"
    0x11, 0x28, // Content-Format 40
    0x37, b'e', b'p', b'=', b'n', b'a', b'm', b'e', // Uri-Query ep=name
    0x06, b'l', b't', b'=', b'1', b'2', b'0', // Uri-Query lt=120
    0x09, b'l', b'w', b'm', b'2', b'm', b'=', b'1', b'.', b'2',
    0x01, b'Q', // Uri-Query Q
    0xFF, b'<', b'1', b'/', b'1', b'>',
  ];
  assert_eq!(&buf[..n], expected);
  assert_eq!(n, 50);
}

#[test]
fn udp_round_trip_preserves_everything() {
  let d = udp::Datagram::new(Type::Con, Id(0x2137), register_msg());
  let mut buf = [0u8; 128];
  let n = udp::encode(&d, &mut buf).unwrap();
  let decoded = udp::decode(&buf[..n]).unwrap();
  assert_eq!(decoded, d);

  // repeated Uri-Query options keep their order
  let queries: Vec<&[u8]> = decoded.msg.opts.get_all(num::URI_QUERY).collect();
  assert_eq!(queries,
             [&b"ep=name"[..], b"lt=120", b"lwm2m=1.2", b"Q"]);
}

#[test]
fn tcp_round_trip_at_every_length_form() {
  for body in [3usize, 100, 400, 70_000] {
    let payload = vec![0x42u8; body];
    let mut msg = Message::new(Code::PUT);
    msg.token = Token::opaque(&[0x01, 0x02]);
    msg.opts.add_u16(num::CONTENT_FORMAT, 60).unwrap();
    msg.payload = &payload;

    let mut buf = vec![0u8; body + 32];
    let n = tcp::encode(&msg, &mut buf).unwrap();
    let decoded = tcp::decode(&buf[..n]).unwrap();
    assert_eq!(decoded.msg, msg, "body len {}", body);
    assert_eq!(decoded.next, None);
  }
}

#[test]
fn tcp_pipelining_offset_contract() {
  let mut first = Message::new(Code::GET);
  first.token = Token::opaque(&[1]);
  first.add_uri_path("3").unwrap();
  let mut second = Message::new(Code::GET);
  second.token = Token::opaque(&[2]);
  second.add_uri_path("4").unwrap();

  let mut buf = [0u8; 64];
  let n1 = tcp::encode(&first, &mut buf).unwrap();
  let n2 = tcp::encode(&second, &mut buf[n1..]).unwrap();

  // a partial stream is incomplete, a full one reports where to resume
  assert_eq!(tcp::decode(&buf[..n1 - 1]).unwrap_err(), FrameError::Incomplete);
  let head = tcp::decode(&buf[..n1 + n2]).unwrap();
  assert_eq!(head.msg, first);
  assert_eq!(head.next, Some(n1));
  let tail = tcp::decode(&buf[n1..n1 + n2]).unwrap();
  assert_eq!(tail.msg, second);
  assert_eq!(tail.next, None);
}

#[test]
fn canonical_option_stream_is_insertion_order_independent() {
  let build = |order: &[u16]| {
    let mut opts = Options::new();
    for n in order {
      match *n {
        | 11 => opts.add_str(newt_msg::OptNumber(11), "rd").unwrap(),
        | 12 => opts.add_u16(newt_msg::OptNumber(12), 40).unwrap(),
        | 15 => opts.add_str(newt_msg::OptNumber(15), "ep=x").unwrap(),
        | 27 => opts.add_u32(newt_msg::OptNumber(27), 0x0A).unwrap(),
        | _ => unreachable!(),
      }
    }
    opts.as_bytes().to_vec()
  };

  let sorted = build(&[11, 12, 15, 27]);
  assert_eq!(build(&[27, 15, 12, 11]), sorted);
  assert_eq!(build(&[12, 27, 11, 15]), sorted);
}

#[test]
fn notification_shape() {
  // Notify: Content + reused token + Observe sequence + payload
  let mut msg = Message::new(Code::CONTENT);
  msg.token = Token::opaque(&[0x0B, 0x0C]);
  msg.opts.add_u32(num::OBSERVE, 7).unwrap();
  msg.opts.add_u16(num::CONTENT_FORMAT, 11544).unwrap();
  msg.payload = &[0xBF, 0x03, 0xBF, 0x00, 0xBF, 0x09, 0x18, 0x2A, 0xFF, 0xFF,
                  0xFF];

  let d = udp::Datagram::new(Type::Non, Id(9), msg);
  let mut buf = [0u8; 64];
  let n = udp::encode(&d, &mut buf).unwrap();
  let back = udp::decode(&buf[..n]).unwrap();
  assert_eq!(back.msg.opts.get_u32(num::OBSERVE).unwrap(), Some(7));
  assert_eq!(back.msg.content_format().unwrap(),
             Some(ContentFormat::Lwm2mCbor));
}
