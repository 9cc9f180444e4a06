use event_chain::is_no_event_cursor;
use event_chain::ClusterTime;
use event_chain::Cursor;
use event_chain::CursorType;
use event_chain::OperType;
use event_chain::NO_EVENT_CURSOR;

#[test]
fn host_update_cursor_round_trips() {
    let cursor = Cursor {
        cursor_type: CursorType::Host,
        cluster_time: ClusterTime::new(1588853652, 0),
        oid: "5eb385974770a118f4922abe".to_string(),
        oper: OperType::Update,
        uniq_key: String::new(),
    };

    let encoded = cursor.encode().unwrap();
    assert!(!is_no_event_cursor(&encoded));
    assert_eq!(Cursor::decode(&encoded).unwrap(), cursor);
}

#[test]
fn sentinel_decodes_to_the_no_event_type() {
    let sentinel = Cursor::decode(NO_EVENT_CURSOR).unwrap();
    assert_eq!(sentinel.cursor_type, CursorType::NoEvent);
    assert_eq!(sentinel.encode().unwrap(), NO_EVENT_CURSOR);
}
