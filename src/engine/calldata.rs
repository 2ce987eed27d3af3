//! Builds calldata for `Invoke`/`Deploy` payloads from a JSON ABI (§4.5:
//! "parses the function/constructor ABI where applicable, builds
//! calldata"). `Transfer` never reaches this; it carries no calldata.
use ethers::abi::{Abi, Param, ParamType, Token};
use ethers::types::{Address, U256};

use crate::types::PayloadVariant;

pub fn build_calldata(payload: &PayloadVariant) -> Result<Vec<u8>, String> {
    match payload {
        PayloadVariant::Transfer { .. } => Ok(Vec::new()),
        PayloadVariant::Invoke { abi, method, args, .. } => {
            let contract = parse_abi(abi)?;
            let function = contract
                .function(method)
                .map_err(|error| format!("function `{method}` not found in ABI: {error}"))?;
            let tokens = encode_tokens(&function.inputs, args)?;
            function
                .encode_input(&tokens)
                .map_err(|error| format!("calldata encoding failed: {error}"))
        }
        PayloadVariant::Deploy {
            abi,
            bytecode,
            constructor_args,
        } => {
            let contract = parse_abi(abi)?;
            match &contract.constructor {
                Some(constructor) => {
                    let tokens = encode_tokens(&constructor.inputs, constructor_args)?;
                    constructor
                        .encode_input(bytecode.to_vec(), &tokens)
                        .map_err(|error| format!("constructor encoding failed: {error}"))
                }
                None => Ok(bytecode.to_vec()),
            }
        }
    }
}

fn parse_abi(abi: &str) -> Result<Abi, String> {
    serde_json::from_str(abi).map_err(|error| format!("invalid ABI JSON: {error}"))
}

fn encode_tokens(params: &[Param], values: &[serde_json::Value]) -> Result<Vec<Token>, String> {
    if params.len() != values.len() {
        return Err(format!("expected {} argument(s), got {}", params.len(), values.len()));
    }
    params.iter().zip(values).map(|(param, value)| json_to_token(value, &param.kind)).collect()
}

fn json_to_token(value: &serde_json::Value, kind: &ParamType) -> Result<Token, String> {
    match kind {
        ParamType::Address => {
            let text = value.as_str().ok_or_else(|| "expected a hex address string".to_string())?;
            strip_hex_prefix(text)
                .parse::<Address>()
                .map(Token::Address)
                .map_err(|error| format!("invalid address `{text}`: {error}"))
        }
        ParamType::Bool => value.as_bool().map(Token::Bool).ok_or_else(|| "expected a boolean".to_string()),
        ParamType::String => value
            .as_str()
            .map(|s| Token::String(s.to_owned()))
            .ok_or_else(|| "expected a string".to_string()),
        ParamType::Int(_) => parse_uint(value).map(Token::Int),
        ParamType::Uint(_) => parse_uint(value).map(Token::Uint),
        ParamType::Bytes => {
            let text = value.as_str().ok_or_else(|| "expected a hex bytes string".to_string())?;
            decode_hex(text).map(Token::Bytes)
        }
        ParamType::FixedBytes(len) => {
            let text = value.as_str().ok_or_else(|| "expected a hex bytes string".to_string())?;
            let bytes = decode_hex(text)?;
            if bytes.len() != *len {
                return Err(format!("expected {len} byte(s), got {}", bytes.len()));
            }
            Ok(Token::FixedBytes(bytes))
        }
        ParamType::Array(inner) => {
            let items = value.as_array().ok_or_else(|| "expected a JSON array".to_string())?;
            let tokens = items.iter().map(|item| json_to_token(item, inner)).collect::<Result<Vec<_>, _>>()?;
            Ok(Token::Array(tokens))
        }
        ParamType::FixedArray(inner, len) => {
            let items = value.as_array().ok_or_else(|| "expected a JSON array".to_string())?;
            if items.len() != *len {
                return Err(format!("expected {len} element(s), got {}", items.len()));
            }
            let tokens = items.iter().map(|item| json_to_token(item, inner)).collect::<Result<Vec<_>, _>>()?;
            Ok(Token::FixedArray(tokens))
        }
        ParamType::Tuple(inner_kinds) => {
            let items = value.as_array().ok_or_else(|| "expected a JSON array for a tuple".to_string())?;
            if items.len() != inner_kinds.len() {
                return Err(format!("expected {} tuple element(s), got {}", inner_kinds.len(), items.len()));
            }
            let tokens = items
                .iter()
                .zip(inner_kinds)
                .map(|(item, kind)| json_to_token(item, kind))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Token::Tuple(tokens))
        }
    }
}

fn parse_uint(value: &serde_json::Value) -> Result<U256, String> {
    if let Some(n) = value.as_u64() {
        return Ok(U256::from(n));
    }
    if let Some(text) = value.as_str() {
        return if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
            U256::from_str_radix(hex, 16).map_err(|error| format!("invalid hex integer `{text}`: {error}"))
        } else {
            U256::from_dec_str(text).map_err(|error| format!("invalid integer `{text}`: {error}"))
        };
    }
    Err("expected a number or numeric string".to_string())
}

fn strip_hex_prefix(text: &str) -> &str {
    text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")).unwrap_or(text)
}

fn decode_hex(text: &str) -> Result<Vec<u8>, String> {
    hex::decode(strip_hex_prefix(text)).map_err(|error| format!("invalid hex `{text}`: {error}"))
}
