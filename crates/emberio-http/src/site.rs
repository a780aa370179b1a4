//! Site collaborator boundary.

use crate::msg::{HttpMsg, Station};

/// Application hook, stepped at each station transition of a message.
/// A non-zero return closes the connection.
pub trait Site {
    fn step_msg(&mut self, msg: &mut HttpMsg) -> i32;
}

/// Minimal demo site: answers every completed request with 200 and either
/// the request body echoed back or a greeting.
pub struct HelloSite;

impl Site for HelloSite {
    fn step_msg(&mut self, msg: &mut HttpMsg) -> i32 {
        if msg.station() != Station::BodyDone || msg.resp_sent() {
            return 0;
        }
        let body = if msg.body().is_empty() {
            b"hello\n".to_vec()
        } else {
            msg.body().to_vec()
        };
        msg.write_status(200, "OK");
        msg.write_head("Content-Type", "text/plain");
        if !msg.keep_alive() {
            msg.write_head("Connection", "close");
        }
        msg.write_body(&body);
        msg.mark_resp_sent();
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn responds_once_at_body_done() {
        let mut site = HelloSite;
        let mut m = HttpMsg::new(1024);
        m.set_station(Station::Head);
        assert_eq!(site.step_msg(&mut m), 0);
        assert_eq!(m.output_len(), 0);
        m.set_station(Station::BodyDone);
        assert_eq!(site.step_msg(&mut m), 0);
        assert!(m.resp_sent());
        let first = m.output_len();
        assert!(first > 0);
        // re-entry must not serialize a second response
        assert_eq!(site.step_msg(&mut m), 0);
        assert_eq!(m.output_len(), first);
    }

    #[test]
    fn echoes_request_body() {
        let mut site = HelloSite;
        let mut m = HttpMsg::new(1024);
        assert!(m.append_body(b"payload"));
        m.set_station(Station::BodyDone);
        site.step_msg(&mut m);
        let out = m.take_output();
        assert!(out.ends_with(b"\r\n\r\npayload"));
    }
}
