//! Tests for Elasticsearch response parsing and bulk encoding, no live cluster needed.

#[cfg(feature = "elasticsearch")]
mod elastic_tests {
    use folio::{Allocation, RebalanceRequestRecord, RequestStatus, StoreError, TransactionBatch};
    use folio::{diff, fingerprint};
    use folio_store::elastic::types::{
        BulkResponse, GetResponse, SearchResponse, bulk_body, classify_status,
    };

    fn batch() -> TransactionBatch {
        let target = Allocation::from([("stocks", 60.0), ("bonds", 40.0)]);
        let current = Allocation::from([("stocks", 50.0), ("bonds", 50.0)]);
        TransactionBatch {
            user_id: "u1".into(),
            request: fingerprint(&target),
            transactions: diff(&target, &current, "u1"),
        }
    }

    // ========================================================================
    // Bulk request body
    // ========================================================================

    #[test]
    fn bulk_body_pairs_action_and_document() {
        let batch = batch();
        let body = bulk_body(&batch, "rebalance_transactions").unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(body.ends_with('\n'), "bulk body must end with a newline");

        let action: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(action["index"]["_index"], "rebalance_transactions");
        assert_eq!(
            action["index"]["_id"],
            format!("u1-{}-bonds", batch.request.short())
        );

        let doc: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(doc["user_id"], "u1");
        assert_eq!(doc["asset"], "bonds");
        assert_eq!(doc["action"], "SELL");
        assert_eq!(doc["rebalance_percent"], 10.0);
        assert_eq!(doc["allocation_hash"], batch.request.as_str());
    }

    #[test]
    fn bulk_body_is_deterministic_across_retries() {
        let a = bulk_body(&batch(), "tx").unwrap();
        let b = bulk_body(&batch(), "tx").unwrap();
        assert_eq!(a, b);
    }

    // ========================================================================
    // Bulk response
    // ========================================================================

    #[test]
    fn parse_bulk_success() {
        let json = r#"{
            "took": 30,
            "errors": false,
            "items": [
                { "index": { "_index": "rebalance_transactions", "_id": "a", "status": 201, "result": "created" } },
                { "index": { "_index": "rebalance_transactions", "_id": "b", "status": 200, "result": "updated" } }
            ]
        }"#;
        let resp: BulkResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.failures().count(), 0);
        assert!(resp.into_result(2).is_ok());
    }

    #[test]
    fn parse_bulk_partial_failure() {
        let json = r#"{
            "took": 12,
            "errors": true,
            "items": [
                { "index": { "_id": "a", "status": 201 } },
                { "index": { "_id": "b", "status": 429,
                    "error": { "type": "es_rejected_execution_exception", "reason": "queue full" } } }
            ]
        }"#;
        let resp: BulkResponse = serde_json::from_str(json).unwrap();
        let err = resp.into_result(2).unwrap_err();
        match err {
            StoreError::Partial {
                failed,
                total,
                reason,
            } => {
                assert_eq!(failed, 1);
                assert_eq!(total, 2);
                assert!(reason.contains("es_rejected_execution_exception"));
                assert!(reason.contains("queue full"));
            }
            other => panic!("expected Partial, got {other:?}"),
        }
    }

    #[test]
    fn partial_bulk_failure_is_retryable() {
        let json = r#"{ "errors": true, "items": [] }"#;
        let resp: BulkResponse = serde_json::from_str(json).unwrap();
        let err = resp.into_result(3).unwrap_err();
        assert!(err.is_retryable());
    }

    // ========================================================================
    // Status classification
    // ========================================================================

    #[test]
    fn server_errors_and_throttling_are_transient() {
        for status in [429u16, 500, 502, 503, 504] {
            assert!(
                matches!(classify_status(status, ""), StoreError::Transient(_)),
                "{status} should be transient"
            );
        }
    }

    #[test]
    fn client_errors_are_fatal() {
        for status in [400u16, 401, 403, 409] {
            let err = classify_status(status, r#"{"error":"mapper_parsing_exception"}"#);
            assert!(matches!(err, StoreError::Fatal(_)), "{status} should be fatal");
            assert!(!err.is_retryable());
        }
    }

    // ========================================================================
    // Ledger documents
    // ========================================================================

    #[test]
    fn parse_get_found() {
        let fp = fingerprint(&Allocation::from([("stocks", 60.0)]));
        let json = format!(
            r#"{{
                "_index": "rebalance_requests",
                "_id": "u1",
                "found": true,
                "_source": {{ "user_id": "u1", "allocation_hash": "{fp}", "status": "PENDING" }}
            }}"#
        );
        let resp: GetResponse<RebalanceRequestRecord> = serde_json::from_str(&json).unwrap();
        assert!(resp.found);
        let record = resp.source.unwrap();
        assert_eq!(record.fingerprint, fp);
        assert_eq!(record.status, RequestStatus::Pending);
    }

    #[test]
    fn parse_get_record_written_without_status() {
        let fp = fingerprint(&Allocation::from([("stocks", 60.0), ("bonds", 40.0)]));
        let json = format!(
            r#"{{
                "_index": "rebalance_requests",
                "_id": "u1",
                "found": true,
                "_source": {{ "user_id": "u1", "allocation_hash": "{fp}", "status": "" }}
            }}"#
        );
        let resp: GetResponse<RebalanceRequestRecord> = serde_json::from_str(&json).unwrap();
        let record = resp.source.unwrap();
        assert_eq!(record.fingerprint, fp);
        assert_eq!(record.status, RequestStatus::Pending);
    }

    #[test]
    fn parse_get_not_found() {
        let json = r#"{ "_index": "rebalance_requests", "_id": "u9", "found": false }"#;
        let resp: GetResponse<RebalanceRequestRecord> = serde_json::from_str(json).unwrap();
        assert!(!resp.found);
        assert!(resp.source.is_none());
    }

    #[test]
    fn parse_search_hits() {
        let fp = fingerprint(&Allocation::from([("gold", 10.0)]));
        let json = format!(
            r#"{{
                "took": 2,
                "hits": {{
                    "total": {{ "value": 1, "relation": "eq" }},
                    "hits": [
                        {{ "_id": "u2", "_score": 1.0,
                           "_source": {{ "user_id": "u2", "allocation_hash": "{fp}", "status": "FAILED" }} }}
                    ]
                }}
            }}"#
        );
        let resp: SearchResponse<RebalanceRequestRecord> = serde_json::from_str(&json).unwrap();
        assert_eq!(resp.hits.hits.len(), 1);
        assert_eq!(resp.hits.hits[0].id, "u2");
        assert_eq!(resp.hits.hits[0].source.status, RequestStatus::Failed);
    }
}
