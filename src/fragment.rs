//! Splits advertising payloads into controller-sized fragments.
//!
//! Extended advertising and scan response data commands carry at most 251
//! bytes per fragment, periodic advertising data 252. Each fragment is tagged
//! with its position; the chain stops at the first non-zero completion status.

use std::sync::Arc;

use crate::hci::MultiAdvCb;

/// Maximum fragment payload for extended advertising / scan response data.
pub const EXT_ADV_DATA_LEN_MAX: usize = 251;
/// Maximum fragment payload for periodic advertising data.
pub const PERIODIC_ADV_DATA_LEN_MAX: usize = 252;

/// Fragment position markers of the LE set-data commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DataOperation {
    Intermediate = 0x00,
    First = 0x01,
    Last = 0x02,
    Complete = 0x03,
}

/// Sends one fragment down to the controller and reports its completion.
/// Cloneable so the continuation of fragment k can issue fragment k+1.
pub type DataSender = Arc<dyn Fn(u8, DataOperation, &[u8], MultiAdvCb) + Send + Sync>;

/// Pushes `data` through `sender` fragment by fragment and calls `done_cb`
/// once with the final status: 0 after the last fragment completed, or the
/// first non-zero fragment status. Empty data still produces one (empty)
/// COMPLETE fragment.
pub fn divide_and_send_data(
    inst_id: u8,
    data: Vec<u8>,
    is_periodic: bool,
    done_cb: MultiAdvCb,
    sender: DataSender,
) {
    send_fragment(inst_id, data, 0, true, is_periodic, done_cb, sender);
}

fn send_fragment(
    inst_id: u8,
    data: Vec<u8>,
    offset: usize,
    is_first: bool,
    is_periodic: bool,
    done_cb: MultiAdvCb,
    sender: DataSender,
) {
    let len_max = if is_periodic { PERIODIC_ADV_DATA_LEN_MAX } else { EXT_ADV_DATA_LEN_MAX };
    let remaining = data.len() - offset;
    let more_than_one_packet = remaining > len_max;
    let operation = match (is_first, more_than_one_packet) {
        (true, true) => DataOperation::First,
        (true, false) => DataOperation::Complete,
        (false, true) => DataOperation::Intermediate,
        (false, false) => DataOperation::Last,
    };
    let end = offset + remaining.min(len_max);

    let chunk = data[offset..end].to_vec();
    let next_sender = sender.clone();
    let cb: MultiAdvCb = Box::new(move |status: u8| {
        if status != 0 || end == data.len() {
            done_cb(status);
            return;
        }
        send_fragment(inst_id, data, end, false, is_periodic, done_cb, next_sender);
    });
    sender(inst_id, operation, &chunk, cb);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    type SentLog = Arc<Mutex<Vec<(DataOperation, Vec<u8>)>>>;

    fn recording_sender(log: SentLog, statuses: Arc<Mutex<Vec<u8>>>) -> DataSender {
        Arc::new(move |_inst_id, op, chunk, cb| {
            log.lock().unwrap().push((op, chunk.to_vec()));
            let status = {
                let mut s = statuses.lock().unwrap();
                if s.is_empty() {
                    0
                } else {
                    s.remove(0)
                }
            };
            cb(status);
        })
    }

    fn run(data: Vec<u8>, is_periodic: bool, statuses: Vec<u8>) -> (Vec<(DataOperation, Vec<u8>)>, Option<u8>) {
        let log: SentLog = Arc::new(Mutex::new(Vec::new()));
        let done: Arc<Mutex<Option<u8>>> = Arc::new(Mutex::new(None));
        let done2 = done.clone();
        divide_and_send_data(
            0,
            data,
            is_periodic,
            Box::new(move |status| {
                *done2.lock().unwrap() = Some(status);
            }),
            recording_sender(log.clone(), Arc::new(Mutex::new(statuses))),
        );
        let calls = log.lock().unwrap().clone();
        let status = *done.lock().unwrap();
        (calls, status)
    }

    #[test]
    fn test_single_complete_fragment() {
        let (calls, status) = run(vec![0xAB; 251], false, vec![]);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, DataOperation::Complete);
        assert_eq!(calls[0].1.len(), 251);
        assert_eq!(status, Some(0));
    }

    #[test]
    fn test_two_fragments() {
        let data: Vec<u8> = (0..500u16).map(|i| i as u8).collect();
        let (calls, status) = run(data.clone(), false, vec![]);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, DataOperation::First);
        assert_eq!(calls[0].1, data[..251].to_vec());
        assert_eq!(calls[1].0, DataOperation::Last);
        assert_eq!(calls[1].1, data[251..].to_vec());
        assert_eq!(calls[1].1.len(), 249);
        assert_eq!(status, Some(0));
    }

    #[test]
    fn test_intermediate_fragments_and_length_sum() {
        let data = vec![0x11u8; 251 * 2 + 10];
        let (calls, status) = run(data.clone(), false, vec![]);
        let ops: Vec<DataOperation> = calls.iter().map(|(op, _)| *op).collect();
        assert_eq!(
            ops,
            vec![DataOperation::First, DataOperation::Intermediate, DataOperation::Last]
        );
        let total: usize = calls.iter().map(|(_, c)| c.len()).sum();
        assert_eq!(total, data.len());
        assert_eq!(status, Some(0));
    }

    #[test]
    fn test_periodic_window_is_252() {
        let data = vec![0u8; 252];
        let (calls, _) = run(data, true, vec![]);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, DataOperation::Complete);
    }

    #[test]
    fn test_empty_data_sends_one_empty_complete() {
        let (calls, status) = run(Vec::new(), false, vec![]);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, DataOperation::Complete);
        assert!(calls[0].1.is_empty());
        assert_eq!(status, Some(0));
    }

    #[test]
    fn test_abort_on_error_status() {
        let data = vec![0u8; 700];
        let (calls, status) = run(data, false, vec![0, 0x0C]);
        assert_eq!(calls.len(), 2);
        assert_eq!(status, Some(0x0C));
    }
}
