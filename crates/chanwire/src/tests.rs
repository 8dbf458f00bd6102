// File: crates/chanwire/src/tests.rs
use crate::*;
use serde_json::json;
use serde_json::Value;

// ============================================================================
//  CLIENT TO SERVER
// ============================================================================

#[test]
fn test_decode_single_request() -> anyhow::Result<()> {
    let text = r#"{"id":1,"method":"query","params":{"path":"greet","input":{"name":"world"}}}"#;
    let items = decode_client_batch(text)?;
    assert_eq!(items.len(), 1);

    let inbound = items.into_iter().next().unwrap()?;
    assert_eq!(inbound.id, Some(RequestId::Number(1)));
    assert_eq!(inbound.jsonrpc, None);
    assert_eq!(
        inbound.action,
        InboundAction::Call(Call::new(OperationKind::Query, "greet", Some(json!({"name": "world"}))))
    );
    Ok(())
}

#[test]
fn test_decode_batch_preserves_order() -> anyhow::Result<()> {
    let text = r#"[
        {"id":1,"method":"query","params":{"path":"a"}},
        {"id":"two","jsonrpc":"2.0","method":"mutation","params":{"path":"b","input":3}},
        {"id":3,"method":"subscription.stop"}
    ]"#;
    let items: Vec<Inbound> = decode_client_batch(text)?.into_iter().collect::<Result<_>>()?;

    assert_eq!(items[0].id, Some(RequestId::Number(1)));
    assert_eq!(items[1].id, Some(RequestId::from("two")));
    assert_eq!(items[1].jsonrpc, Some(JsonRpc));
    assert_eq!(items[2].action, InboundAction::Stop);
    Ok(())
}

#[test]
fn test_decode_malformed_item_is_isolated() -> anyhow::Result<()> {
    let text = r#"[
        {"id":1,"method":"query","params":{"path":"a"}},
        {"id":2,"method":"teleport","params":{"path":"b"}},
        "not an object"
    ]"#;
    let items = decode_client_batch(text)?;

    assert!(items[0].is_ok());
    let bad = items[1].as_ref().unwrap_err();
    assert_eq!(bad.raw().and_then(|raw| raw.get("method")), Some(&json!("teleport")));
    let scalar = items[2].as_ref().unwrap_err();
    assert_eq!(scalar.raw(), Some(&json!("not an object")));
    Ok(())
}

#[test]
fn test_decode_null_id_is_structurally_valid() -> anyhow::Result<()> {
    let items = decode_client_batch(r#"{"id":null,"method":"query","params":{"path":"a"}}"#)?;
    let inbound = items.into_iter().next().unwrap()?;
    assert_eq!(inbound.id, None);
    Ok(())
}

#[test]
fn test_decode_input_is_not_validated() -> anyhow::Result<()> {
    let text = r#"{"id":1,"method":"mutation","params":{"path":"p","input":[1,{"deep":null}]}}"#;
    let inbound = decode_client_batch(text)?.into_iter().next().unwrap()?;
    let InboundAction::Call(call) = inbound.action else {
        panic!("expected a call");
    };
    assert_eq!(call.input, Some(json!([1, {"deep": null}])));
    Ok(())
}

#[test]
fn test_decode_missing_id_fails() {
    let items = decode_client_batch(r#"{"method":"query","params":{"path":"a"}}"#).unwrap();
    assert!(items[0].is_err());
}

// ============================================================================
//  SERVER TO CLIENT
// ============================================================================

#[test]
fn test_response_wire_format() -> anyhow::Result<()> {
    let data = ResponseEnvelope::result(RequestId::Number(1), None, ResultPayload::data(json!("Hello world")));
    assert_eq!(encode(&data)?, r#"{"id":1,"result":{"type":"data","data":"Hello world"}}"#);

    let started = ResponseEnvelope::result(RequestId::Number(2), Some(JsonRpc), ResultPayload::Started);
    assert_eq!(encode(&started)?, r#"{"id":2,"jsonrpc":"2.0","result":{"type":"started"}}"#);

    let stopped = ResponseEnvelope::result(RequestId::from("s"), None, ResultPayload::Stopped);
    assert_eq!(encode(&stopped)?, r#"{"id":"s","result":{"type":"stopped"}}"#);
    Ok(())
}

#[test]
fn test_error_wire_format() -> anyhow::Result<()> {
    let shape = ErrorShape::new(ErrorCode::BadRequest, "Duplicate id 4", Some("ticks".into()));
    let resp = ResponseEnvelope::error(Some(RequestId::Number(4)), None, shape);
    let value: Value = serde_json::from_str(&encode(&resp)?)?;
    assert_eq!(
        value,
        json!({
            "id": 4,
            "error": {
                "message": "Duplicate id 4",
                "code": -32600,
                "data": {"code": "BAD_REQUEST", "httpStatus": 400, "path": "ticks"}
            }
        })
    );
    Ok(())
}

#[test]
fn test_parse_error_is_untargeted() -> anyhow::Result<()> {
    let text = encode(&ResponseEnvelope::parse_error("Unexpected token"))?;
    let value: Value = serde_json::from_str(&text)?;
    assert_eq!(value["id"], Value::Null);
    assert_eq!(value["error"]["code"], json!(-32700));
    assert_eq!(value["error"]["data"]["code"], json!("PARSE_ERROR"));
    Ok(())
}

#[test]
fn test_decode_responses() -> anyhow::Result<()> {
    let text = r#"[
        {"id":1,"jsonrpc":"2.0","result":{"type":"data","data":{"x":1}}},
        {"id":2,"result":{"type":"stopped"}},
        {"id":null,"error":{"message":"bad","code":-32700,"data":{"code":"PARSE_ERROR","httpStatus":400}}},
        {"id":null,"method":"reconnect"}
    ]"#;
    let items: Vec<ServerMessage> = decode_server_batch(text)?.into_iter().collect::<Result<_>>()?;

    let ServerMessage::Response(first) = &items[0] else { panic!("expected response") };
    assert_eq!(first.body, ResponseBody::Result(ResultPayload::data(json!({"x": 1}))));

    let ServerMessage::Response(second) = &items[1] else { panic!("expected response") };
    assert!(second.body.is_stopped());

    let ServerMessage::Response(third) = &items[2] else { panic!("expected response") };
    assert_eq!(third.id, None);
    let ResponseBody::Error(shape) = &third.body else { panic!("expected error") };
    assert_eq!(shape.error_code(), ErrorCode::ParseError);

    assert_eq!(items[3], ServerMessage::Reconnect);
    Ok(())
}

#[test]
fn test_reconnect_wire_format() -> anyhow::Result<()> {
    assert_eq!(encode(&ServerMessage::Reconnect)?, r#"{"id":null,"method":"reconnect"}"#);
    Ok(())
}

#[test]
fn test_decode_rejects_unknown_result_type() {
    let items = decode_server_batch(r#"{"id":1,"result":{"type":"paused"}}"#).unwrap();
    assert!(items[0].is_err());
}

#[test]
fn test_error_codes_are_consistent() {
    for code in [
        ErrorCode::ParseError,
        ErrorCode::BadRequest,
        ErrorCode::InternalServerError,
        ErrorCode::NotFound,
        ErrorCode::TooManyRequests,
    ] {
        let shape = ErrorShape::new(code, code.as_str(), None);
        let encoded = serde_json::to_value(&shape).unwrap();
        assert_eq!(encoded["data"]["code"], json!(code.as_str()));
        assert_eq!(encoded["data"]["httpStatus"], json!(code.http_status()));
        assert_eq!(encoded["code"], json!(code.json_rpc_code()));
    }
}
