//! The output-capture sink: forwards captured text immediately to the
//! transport as `STDOUT` envelopes, mirroring the original's `ShmOut`
//! object swapped in for `sys.stdout`.

use std::rc::Rc;
use std::cell::RefCell;

use sandbox_protocol::PolicyClient;

pub struct CaptureSink<W> {
    client: Rc<RefCell<PolicyClient<W>>>,
}

impl<W: std::io::Write> CaptureSink<W> {
    pub fn new(client: Rc<RefCell<PolicyClient<W>>>) -> Self {
        Self { client }
    }

    pub fn write_str(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.client.borrow_mut().send_stdout(text.as_bytes().to_vec());
    }
}
