//! Integration tests for locator-backed BLOB and CLOB values

mod common;

use std::io::{Read, Write};

use common::{config, FakeServer};
use drda_client::constants::VARCHAR_MAXWIDTH;
use drda_client::exception::SqlException;
use drda_client::{Blob, Clob, MessageId};

fn sql_state<T: std::fmt::Debug>(result: drda_client::Result<T>) -> String {
    result
        .unwrap_err()
        .sql_state()
        .unwrap_or_default()
        .to_string()
}

mod blob_locator_tests {
    use super::*;

    #[test]
    fn test_create_blob_uses_a_locator() {
        let server = FakeServer::new();
        let conn = server.connect();

        let mut blob = conn.create_blob().unwrap();
        assert!(blob.is_locator());
        let id = blob.locator().unwrap();

        assert_eq!(blob.set_bytes(1, b"hello").unwrap(), 5);
        assert_eq!(blob.length().unwrap(), 5);
        assert_eq!(blob.get_bytes(2, 3).unwrap(), b"ell");
        assert_eq!(server.state().blobs[&id], b"hello");
    }

    #[test]
    fn test_large_transfers_are_chunked() {
        let server = FakeServer::new();
        let conn = server.connect();
        let size = VARCHAR_MAXWIDTH * 3 + VARCHAR_MAXWIDTH / 2;
        let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();

        let mut blob = conn.create_blob().unwrap();
        blob.set_bytes(1, &data).unwrap();
        assert_eq!(server.state().executions("BLOBSETBYTES"), 4);

        let read = blob.get_bytes(1, size as i32).unwrap();
        assert_eq!(read, data);
        assert_eq!(server.state().executions("BLOBGETBYTES"), 4);
        // The procedure is prepared once for every chunk
        assert_eq!(server.state().prepares("BLOBGETBYTES"), 1);
    }

    #[test]
    fn test_length_is_fetched_once() {
        let server = FakeServer::new();
        let conn = server.connect();
        let id = server.state().put_blob(vec![7; 100]);

        let mut blob = conn.blob_from_locator(id);
        assert_eq!(blob.length().unwrap(), 100);
        assert_eq!(blob.length().unwrap(), 100);
        assert_eq!(server.state().executions("BLOBGETLENGTH"), 1);
    }

    #[test]
    fn test_position_restarts_after_partial_match() {
        let server = FakeServer::new();
        let conn = server.connect();

        let run = vec![b'a'; VARCHAR_MAXWIDTH];
        let mut data = run.clone();
        data.push(b'b');
        data.extend_from_slice(&run);
        data.extend_from_slice(b"XYZ");
        let mut pattern = run.clone();
        pattern.extend_from_slice(b"XYZ");
        let id = server.state().put_blob(data);

        let mut blob = conn.blob_from_locator(id);
        let found = blob.position(&pattern, 1).unwrap();
        assert_eq!(found, VARCHAR_MAXWIDTH as i64 + 2);

        let state = server.state();
        // First chunk, failed continuation, first chunk again, continuation
        assert_eq!(state.executions("BLOBGETPOSITIONFROMBYTES"), 4);
        assert_eq!(state.executions("BLOBGETLENGTH"), 1);
    }

    #[test]
    fn test_position_gives_up_when_pattern_cannot_fit() {
        let server = FakeServer::new();
        let conn = server.connect();

        let mut data = vec![b'a'; VARCHAR_MAXWIDTH];
        data.extend_from_slice(b"NOPE");
        let mut pattern = vec![b'a'; VARCHAR_MAXWIDTH];
        pattern.extend_from_slice(b"XYZ");
        let id = server.state().put_blob(data);

        let mut blob = conn.blob_from_locator(id);
        assert_eq!(blob.position(&pattern, 1).unwrap(), -1);
    }

    #[test]
    fn test_short_pattern_position() {
        let server = FakeServer::new();
        let conn = server.connect();
        let id = server.state().put_blob(b"abcabc".to_vec());

        let mut blob = conn.blob_from_locator(id);
        assert_eq!(blob.position(b"bc", 1).unwrap(), 2);
        assert_eq!(blob.position(b"bc", 3).unwrap(), 5);
        assert_eq!(blob.position(b"zz", 1).unwrap(), -1);
        assert_eq!(sql_state(blob.position(b"", 1)), "XJ072");
    }

    #[test]
    fn test_position_of_locator_pattern() {
        let server = FakeServer::new();
        let conn = server.connect();
        let id = server.state().put_blob(b"the quick brown fox".to_vec());
        let pattern_id = server.state().put_blob(b"brown".to_vec());

        let mut blob = conn.blob_from_locator(id);
        let mut pattern = conn.blob_from_locator(pattern_id);
        assert_eq!(blob.position_blob(&mut pattern, 1).unwrap(), 11);
        assert_eq!(
            server.state().executions("BLOBGETPOSITIONFROMLOCATOR"),
            1
        );

        let mut local = Blob::new(b"quick".to_vec());
        assert_eq!(blob.position_blob(&mut local, 1).unwrap(), 5);
    }

    #[test]
    fn test_truncate_on_server() {
        let server = FakeServer::new();
        let conn = server.connect();
        let id = server.state().put_blob(b"abcdef".to_vec());

        let mut blob = conn.blob_from_locator(id);
        blob.truncate(3).unwrap();
        assert_eq!(blob.length().unwrap(), 3);
        assert_eq!(server.state().blobs[&id], b"abc");
        assert_eq!(sql_state(blob.truncate(4)), "XJ081");
    }

    #[test]
    fn test_stream_reads_from_locator() {
        let server = FakeServer::new();
        let conn = server.connect();
        let data: Vec<u8> = (0..70_000u32).map(|i| (i % 13) as u8).collect();
        let id = server.state().put_blob(data.clone());

        let mut blob = conn.blob_from_locator(id);
        let mut read = Vec::new();
        blob.binary_stream().unwrap().read_to_end(&mut read).unwrap();
        assert_eq!(read, data);

        let mut part = Vec::new();
        blob.binary_stream_range(32_000, 1_000)
            .unwrap()
            .read_to_end(&mut part)
            .unwrap();
        assert_eq!(part, &data[31_999..32_999]);
        assert_eq!(sql_state(blob.binary_stream_range(69_999, 3)), "XJ087");
    }

    #[test]
    fn test_stream_invalidated_by_write() {
        let server = FakeServer::new();
        let conn = server.connect();
        let mut blob = conn.create_blob().unwrap();
        blob.set_bytes(1, b"0123456789").unwrap();

        let mut reader = blob.binary_stream().unwrap();
        blob.set_bytes(1, b"x").unwrap();

        let mut buf = [0u8; 4];
        let err = reader.read(&mut buf).unwrap_err();
        let inner = err
            .get_ref()
            .and_then(|e| e.downcast_ref::<SqlException>())
            .expect("SQL exception inside the I/O error");
        assert_eq!(inner.message_id(), Some(MessageId::LobChanged));
        assert_eq!(inner.sql_state(), "XJ088");
    }

    #[test]
    fn test_writer_through_locator() {
        let server = FakeServer::new();
        let conn = server.connect();
        let mut blob = conn.create_blob().unwrap();
        let id = blob.locator().unwrap();
        {
            let mut writer = blob.set_binary_stream(1).unwrap();
            writer.write_all(b"stream").unwrap();
            writer.write_all(b"ed").unwrap();
            writer.flush().unwrap();
        }
        assert_eq!(server.state().blobs[&id], b"streamed");
    }
}

mod clob_locator_tests {
    use super::*;

    #[test]
    fn test_clob_locator_round_trip() {
        let server = FakeServer::new();
        let conn = server.connect();

        let mut clob = conn.create_clob().unwrap();
        assert!(clob.is_locator());
        clob.set_string(1, "grüße, world").unwrap();
        assert_eq!(clob.length().unwrap(), 12);
        assert_eq!(clob.get_sub_string(1, 5).unwrap(), "grüße");
        assert_eq!(clob.position("world", 1).unwrap(), 8);

        let mut text = String::new();
        clob.character_stream()
            .unwrap()
            .read_to_string(&mut text)
            .unwrap();
        assert_eq!(text, "grüße, world");
    }

    #[test]
    fn test_clob_chunks_count_characters() {
        let server = FakeServer::new();
        let conn = server.connect();
        let text: String = std::iter::repeat('é').take(VARCHAR_MAXWIDTH + 10).collect();

        let mut clob = conn.create_clob().unwrap();
        let id = clob.locator().unwrap();
        clob.set_string(1, &text).unwrap();
        assert_eq!(server.state().executions("CLOBSETSTRING"), 2);
        assert_eq!(server.state().clobs[&id].len(), VARCHAR_MAXWIDTH + 10);

        let read = clob.get_sub_string(1, (VARCHAR_MAXWIDTH + 10) as i32).unwrap();
        assert_eq!(read, text);
    }

    #[test]
    fn test_clob_position_of_locator_pattern() {
        let server = FakeServer::new();
        let conn = server.connect();
        let id = server.state().put_clob("hello world");
        let pattern_id = server.state().put_clob("world");

        let mut clob = conn.clob_from_locator(id);
        let mut pattern = conn.clob_from_locator(pattern_id);
        assert_eq!(clob.position_clob(&mut pattern, 1).unwrap(), 7);
        let mut local = Clob::new("lo w");
        assert_eq!(clob.position_clob(&mut local, 1).unwrap(), 4);
    }
}

mod fallback_tests {
    use super::*;

    #[test]
    fn test_missing_procedures_fall_back_to_memory() {
        let server = FakeServer::new();
        server.state().missing_procedures.push("BLOBCREATELOCATOR");
        let conn = server.connect();

        let mut blob = conn.create_blob().unwrap();
        assert!(!blob.is_locator());
        blob.set_bytes(1, b"local").unwrap();
        assert_eq!(blob.get_bytes(1, 5).unwrap(), b"local");

        // The missing procedure is remembered for the session
        let second = conn.create_blob().unwrap();
        assert!(!second.is_locator());
        assert_eq!(server.state().prepares("BLOBCREATELOCATOR"), 1);

        // CLOB support is tracked separately
        let clob = conn.create_clob().unwrap();
        assert!(clob.is_locator());
    }

    #[test]
    fn test_fallback_is_forgotten_on_reset() {
        let server = FakeServer::new();
        server.state().missing_procedures.push("BLOBCREATELOCATOR");
        let conn = server.connect();
        assert!(!conn.create_blob().unwrap().is_locator());

        server.state().missing_procedures.clear();
        conn.reset_with_transport(server.transport()).unwrap();
        assert!(conn.create_blob().unwrap().is_locator());
    }

    #[test]
    fn test_memory_blob_survives_commit_but_not_close() {
        let server = FakeServer::new();
        server.state().missing_procedures.push("BLOBCREATELOCATOR");
        let conn = server.connect();
        let mut blob = conn.create_blob().unwrap();
        blob.set_bytes(1, b"abc").unwrap();

        conn.commit().unwrap();
        assert_eq!(blob.length().unwrap(), 3);

        conn.close();
        assert_eq!(sql_state(blob.length()), "XJ215");
    }
}

mod validity_tests {
    use super::*;

    #[test]
    fn test_commit_invalidates_locators() {
        let server = FakeServer::new();
        let conn = server.connect();
        let mut blob = conn.create_blob().unwrap();
        blob.set_bytes(1, b"abc").unwrap();

        conn.commit().unwrap();
        assert_eq!(sql_state(blob.get_bytes(1, 1)), "XJ215");
        assert_eq!(sql_state(blob.length()), "XJ215");

        // Nothing is released for a locator of an ended transaction
        drop(blob);
        assert!(server.state().released.is_empty());
    }

    #[test]
    fn test_failed_commit_keeps_locators() {
        let server = FakeServer::new();
        let conn = server
            .connect_with(config().retrieve_message_text(false))
            .unwrap();
        let mut blob = conn.create_blob().unwrap();
        blob.set_bytes(1, b"abc").unwrap();

        server.state().failing_commit = Some((-1, "40001"));
        let err = conn.commit().unwrap_err();
        assert_eq!(err.sql_state(), Some("40001"));
        assert_eq!(blob.get_bytes(1, 3).unwrap(), b"abc");

        conn.commit().unwrap();
        assert_eq!(sql_state(blob.get_bytes(1, 1)), "XJ215");
    }

    #[test]
    fn test_close_invalidates_locators() {
        let server = FakeServer::new();
        let conn = server.connect();
        let mut clob = conn.create_clob().unwrap();
        conn.close();
        assert_eq!(sql_state(clob.get_sub_string(1, 1)), "XJ215");

        // Detached values do not depend on any connection
        let mut local = Clob::new("still here");
        assert_eq!(local.length().unwrap(), 10);
    }

    #[test]
    fn test_freed_lob() {
        let server = FakeServer::new();
        let conn = server.connect();
        let mut blob = conn.create_blob().unwrap();
        let id = blob.locator().unwrap();

        blob.free().unwrap();
        blob.free().unwrap();
        assert!(blob.is_freed());
        assert_eq!(sql_state(blob.get_bytes(1, 1)), "XJ073");
        assert_eq!(server.state().released, vec![id]);
        assert_eq!(server.state().executions("BLOBRELEASELOCATOR"), 1);
    }

    #[test]
    fn test_freed_takes_precedence_over_closed() {
        let server = FakeServer::new();
        let conn = server.connect();
        let mut blob = conn.create_blob().unwrap();
        blob.free().unwrap();
        conn.close();
        assert_eq!(sql_state(blob.length()), "XJ073");
    }

    #[test]
    fn test_drop_releases_locator() {
        let server = FakeServer::new();
        let conn = server.connect();
        let id = {
            let blob = conn.create_blob().unwrap();
            blob.locator().unwrap()
        };
        assert_eq!(server.state().released, vec![id]);
        assert!(!server.state().blobs.contains_key(&id));
    }

    #[test]
    fn test_server_invalid_locator() {
        let server = FakeServer::new();
        let conn = server.connect();
        let mut blob = conn.blob_from_locator(999);
        let err = blob.length().unwrap_err();
        assert_eq!(err.sql_state(), Some("XJ215"));
        assert_eq!(err.message_id(), Some(MessageId::LobObjectInvalid));
    }

    #[test]
    fn test_failed_release_surfaces_on_next_call() {
        let server = FakeServer::new();
        let conn = server
            .connect_with(config().retrieve_message_text(false))
            .unwrap();
        let blob = conn.create_blob().unwrap();
        let id = blob.locator().unwrap();

        // The server loses the locator before the value is dropped
        server.state().blobs.remove(&id);
        drop(blob);

        let err = conn.commit().unwrap_err();
        assert_eq!(err.sql_state(), Some("XJ215"));
        assert_eq!(server.state().commits, 0);

        // Raised once, then the session carries on
        conn.commit().unwrap();
        assert_eq!(server.state().commits, 1);
    }
}

mod materialize_tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_materialized_blob_releases_its_locator() {
        let server = FakeServer::new();
        let conn = server.connect();
        let mut blob = conn.create_blob().unwrap();
        let id = blob.locator().unwrap();
        blob.set_bytes(1, b"hello").unwrap();

        blob.materialize().unwrap();
        assert!(!blob.is_locator());
        assert_eq!(server.state().released, vec![id]);
        assert!(!server.state().blobs.contains_key(&id));

        // The value now lives on the client and outlives the transaction
        conn.commit().unwrap();
        assert_eq!(blob.get_bytes(1, 10).unwrap(), b"hello");
        drop(blob);
        assert_eq!(server.state().executions("BLOBRELEASELOCATOR"), 1);
    }

    #[test]
    fn test_materialized_clob_releases_its_locator() {
        let server = FakeServer::new();
        let conn = server.connect();
        let id = server.state().put_clob("grüße");
        let mut clob = conn.clob_from_locator(id);

        clob.materialize().unwrap();
        assert_eq!(server.state().released, vec![id]);
        assert_eq!(clob.get_sub_string(2, 3).unwrap(), "rüß");
        clob.free().unwrap();
        assert_eq!(server.state().executions("CLOBRELEASELOCATOR"), 1);
    }

    #[test]
    fn test_declared_stream_length_differs_from_data() {
        let server = FakeServer::new();
        let conn = server.connect();

        let mut short = Blob::from_reader(Cursor::new(b"abc".to_vec()), Some(10));
        let bytes = short.get_bytes(1, 10).unwrap();
        assert_eq!(short.length().unwrap(), 3);

        let mut target = conn.create_blob().unwrap();
        target.set_bytes(1, &bytes).unwrap();
        let id = target.locator().unwrap();
        assert_eq!(server.state().blobs[&id], b"abc");

        let mut text = Clob::from_reader(Cursor::new(b"abc".to_vec()), Some(10));
        assert_eq!(text.get_sub_string(1, 10).unwrap(), "abc");
        assert_eq!(sql_state(text.get_sub_string(5, 1)), "XJ076");

        let mut long = Clob::from_reader(Cursor::new(b"abcdef".to_vec()), Some(2));
        assert_eq!(long.position("c", 1).unwrap(), -1);
        assert_eq!(long.length().unwrap(), 2);
    }
}

mod bind_tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    /// Run `f` on another thread, failing if it does not finish in time
    fn finishes<F>(f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let (done, finished) = mpsc::channel();
        thread::spawn(move || {
            f();
            let _ = done.send(());
        });
        finished
            .recv_timeout(Duration::from_secs(10))
            .expect("bind closure did not complete");
    }

    #[test]
    fn test_lob_read_inside_bind() {
        let server = FakeServer::new();
        let conn = server.connect();
        let mut blob = conn.create_blob().unwrap();
        blob.set_bytes(1, b"payload").unwrap();

        finishes(move || {
            let results = conn
                .call("INSERT INTO DOCS (BODY) VALUES (?)", |stmt| {
                    let length = blob.length()?.min(i32::MAX as u64) as i32;
                    let bytes = blob.get_bytes(1, length)?;
                    stmt.set_bytes(1, &bytes)
                })
                .unwrap();
            assert_eq!(results.update_count(), 1);
        });
        assert_eq!(server.state().executions("INSERT INTO DOCS"), 1);
    }

    #[test]
    fn test_locator_dropped_inside_bind() {
        let server = FakeServer::new();
        let conn = server.connect();
        let blob = conn.create_blob().unwrap();
        let id = blob.locator().unwrap();

        let caller = conn.clone();
        finishes(move || {
            caller
                .call("DELETE FROM DOCS WHERE ID = ?", |stmt| {
                    drop(blob);
                    stmt.set_int(1, 7)
                })
                .unwrap();
        });
        assert_eq!(server.state().released, vec![id]);
        assert_eq!(server.state().executions("DELETE FROM DOCS"), 1);
    }
}
