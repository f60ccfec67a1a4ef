//! Method dispatcher
//!
//! Requests name one entry of a closed method table. Each method declares its
//! argument schema as a typed parameter struct and maps to exactly one
//! vendor-module entry point:
//! 1. `method` is looked up in [`Method::ALL`] (unknown names fail here)
//! 2. the request is decoded into the method's parameters (still no foreign
//!    interaction)
//! 3. [`MethodCall::plan`] describes the foreign call as data
//! 4. [`execute`] marshals the plan into foreign values under the execution
//!    lock and marshals the result back
//!
//! Adding a method means adding a [`Method`] variant, its parameters and its
//! plan.

use crate::codec::{kind_of, Document};
use crate::error::BridgeError;
use crate::foreign::ForeignSession;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map};

/// Vendor entry point invoked once the module is imported at initialize.
pub const SETUP_ENTRY: &str = "initialize";
/// Vendor entry point invoked best-effort at shutdown.
pub const TEARDOWN_ENTRY: &str = "shutdown";

pub const TIMEFRAME_M1: &str = "TIMEFRAME_M1";
pub const TRADE_ACTION_DEAL: i64 = 1;
pub const ORDER_TYPE_BUY: i64 = 0;
pub const ORDER_TYPE_SELL: i64 = 1;

/// The method table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    GetM1Bars,
    OpenMarketBuy,
    OpenMarketSell,
    TerminalInfo,
    AccountInfo,
    SymbolInfo,
    LastError,
}

impl Method {
    pub const ALL: [Method; 7] = [
        Method::GetM1Bars,
        Method::OpenMarketBuy,
        Method::OpenMarketSell,
        Method::TerminalInfo,
        Method::AccountInfo,
        Method::SymbolInfo,
        Method::LastError,
    ];

    /// Name used in the request's `method` field.
    pub fn name(self) -> &'static str {
        match self {
            Method::GetM1Bars => "get_m1_bars",
            Method::OpenMarketBuy => "open_market_buy",
            Method::OpenMarketSell => "open_market_sell",
            Method::TerminalInfo => "terminal_info",
            Method::AccountInfo => "account_info",
            Method::SymbolInfo => "symbol_info",
            Method::LastError => "last_error",
        }
    }

    /// Vendor-module function the method calls.
    pub fn entry_point(self) -> &'static str {
        match self {
            Method::GetM1Bars => "copy_rates_from_pos",
            Method::OpenMarketBuy | Method::OpenMarketSell => "order_send",
            Method::TerminalInfo => "terminal_info",
            Method::AccountInfo => "account_info",
            Method::SymbolInfo => "symbol_info",
            Method::LastError => "last_error",
        }
    }

    pub fn from_name(name: &str) -> Option<Method> {
        Method::ALL.into_iter().find(|m| m.name() == name)
    }
}

#[derive(Debug, Deserialize)]
struct BarsParams {
    symbol: String,
    count: u32,
}

#[derive(Debug, Deserialize)]
struct SymbolParams {
    symbol: String,
}

/// Market order parameters shared by the buy and sell methods.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketOrder {
    pub symbol: String,
    pub volume: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deviation: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub magic: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// A request that passed schema validation.
#[derive(Debug, Clone, PartialEq)]
pub enum MethodCall {
    GetM1Bars { symbol: String, count: u32 },
    OpenMarketBuy(MarketOrder),
    OpenMarketSell(MarketOrder),
    TerminalInfo,
    AccountInfo,
    SymbolInfo { symbol: String },
    LastError,
}

impl MethodCall {
    /// Validate a request document against the method table.
    pub fn from_request(request: &Document) -> Result<MethodCall, BridgeError> {
        let fields = request.as_object().ok_or_else(|| {
            BridgeError::InvalidRequest(format!(
                "request must be an object, got {}",
                kind_of(request)
            ))
        })?;
        let name = match fields.get("method") {
            None => return Err(BridgeError::InvalidRequest("missing method".to_string())),
            Some(Document::String(name)) => name,
            Some(other) => {
                return Err(BridgeError::InvalidRequest(format!(
                    "method must be a string, got {}",
                    kind_of(other)
                )))
            }
        };
        let method =
            Method::from_name(name).ok_or_else(|| BridgeError::UnknownMethod(name.clone()))?;

        let call = match method {
            Method::GetM1Bars => {
                let p: BarsParams = params(method, request)?;
                if p.count == 0 || p.count > i32::MAX as u32 {
                    return Err(BridgeError::invalid_argument(
                        method.name(),
                        format!("count must be between 1 and {}, got {}", i32::MAX, p.count),
                    ));
                }
                MethodCall::GetM1Bars {
                    symbol: check_symbol(method, p.symbol)?,
                    count: p.count,
                }
            }
            Method::OpenMarketBuy => MethodCall::OpenMarketBuy(market_order(method, request)?),
            Method::OpenMarketSell => MethodCall::OpenMarketSell(market_order(method, request)?),
            Method::TerminalInfo => MethodCall::TerminalInfo,
            Method::AccountInfo => MethodCall::AccountInfo,
            Method::SymbolInfo => {
                let p: SymbolParams = params(method, request)?;
                MethodCall::SymbolInfo {
                    symbol: check_symbol(method, p.symbol)?,
                }
            }
            Method::LastError => MethodCall::LastError,
        };
        Ok(call)
    }

    pub fn method(&self) -> Method {
        match self {
            MethodCall::GetM1Bars { .. } => Method::GetM1Bars,
            MethodCall::OpenMarketBuy(_) => Method::OpenMarketBuy,
            MethodCall::OpenMarketSell(_) => Method::OpenMarketSell,
            MethodCall::TerminalInfo => Method::TerminalInfo,
            MethodCall::AccountInfo => Method::AccountInfo,
            MethodCall::SymbolInfo { .. } => Method::SymbolInfo,
            MethodCall::LastError => Method::LastError,
        }
    }

    /// The foreign call this request turns into.
    pub fn plan(&self) -> ForeignCall {
        let entry = self.method().entry_point();
        let args = match self {
            MethodCall::GetM1Bars { symbol, count } => vec![
                Arg::Doc(json!(symbol)),
                Arg::Constant(TIMEFRAME_M1),
                Arg::Doc(json!(0)),
                Arg::Doc(json!(count)),
            ],
            MethodCall::OpenMarketBuy(order) => vec![Arg::Doc(order_record(order, ORDER_TYPE_BUY))],
            MethodCall::OpenMarketSell(order) => {
                vec![Arg::Doc(order_record(order, ORDER_TYPE_SELL))]
            }
            MethodCall::SymbolInfo { symbol } => vec![Arg::Doc(json!(symbol))],
            MethodCall::TerminalInfo | MethodCall::AccountInfo | MethodCall::LastError => {
                Vec::new()
            }
        };
        ForeignCall { entry, args }
    }
}

fn params<P: DeserializeOwned>(method: Method, request: &Document) -> Result<P, BridgeError> {
    P::deserialize(request).map_err(|e| BridgeError::invalid_argument(method.name(), e.to_string()))
}

fn check_symbol(method: Method, symbol: String) -> Result<String, BridgeError> {
    if symbol.trim().is_empty() {
        return Err(BridgeError::invalid_argument(
            method.name(),
            "symbol must not be empty",
        ));
    }
    Ok(symbol)
}

fn market_order(method: Method, request: &Document) -> Result<MarketOrder, BridgeError> {
    let order: MarketOrder = params(method, request)?;
    if !order.volume.is_finite() || order.volume <= 0.0 {
        return Err(BridgeError::invalid_argument(
            method.name(),
            format!("volume must be a positive number, got {}", order.volume),
        ));
    }
    Ok(MarketOrder {
        symbol: check_symbol(method, order.symbol)?,
        ..order
    })
}

/// The order record handed to `order_send`.
fn order_record(order: &MarketOrder, order_type: i64) -> Document {
    let mut record = Map::new();
    record.insert("action".into(), json!(TRADE_ACTION_DEAL));
    record.insert("symbol".into(), json!(order.symbol));
    record.insert("volume".into(), json!(order.volume));
    record.insert("type".into(), json!(order_type));
    if let Some(deviation) = order.deviation {
        record.insert("deviation".into(), json!(deviation));
    }
    if let Some(magic) = order.magic {
        record.insert("magic".into(), json!(magic));
    }
    if let Some(comment) = &order.comment {
        record.insert("comment".into(), json!(comment));
    }
    Document::Object(record)
}

/// A positional argument of a foreign call.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    /// Marshaled from a document.
    Doc(Document),
    /// Read from the vendor module by name.
    Constant(&'static str),
}

/// One vendor-module call described as data.
#[derive(Debug, Clone, PartialEq)]
pub struct ForeignCall {
    pub entry: &'static str,
    pub args: Vec<Arg>,
}

impl ForeignCall {
    /// A call without arguments.
    pub fn bare(entry: &'static str) -> Self {
        Self {
            entry,
            args: Vec::new(),
        }
    }
}

/// Run `call` against `vendor_module`. Must be called with the execution
/// lock held; every handle created here is released before returning.
pub fn execute<S: ForeignSession>(
    session: &mut S,
    vendor_module: &str,
    call: &ForeignCall,
) -> Result<Document, BridgeError> {
    let module = session.import_module(vendor_module)?;

    let mut args = Vec::with_capacity(call.args.len());
    for arg in &call.args {
        let value = match arg {
            Arg::Doc(doc) => session.to_foreign(doc)?,
            Arg::Constant(name) => session.get_attr(&module, name)?,
        };
        args.push(value);
    }
    let refs: Vec<&S::Value> = args.iter().collect();

    let result = session.call_method(&module, call.entry, &refs)?;
    session.to_document(&result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foreign::{ForeignRuntime, RuntimeConfig};
    use crate::scripted::{metatrader_module, ScriptedRuntime};

    fn invalid(request: Document) -> BridgeError {
        MethodCall::from_request(&request).unwrap_err()
    }

    #[test]
    fn method_names_are_unique_and_resolve() {
        for method in Method::ALL {
            assert_eq!(Method::from_name(method.name()), Some(method));
        }
        let mut names: Vec<_> = Method::ALL.iter().map(|m| m.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), Method::ALL.len());
    }

    #[test]
    fn missing_method_is_an_invalid_request() {
        assert_eq!(
            invalid(json!({"symbol": "EURUSD"})),
            BridgeError::InvalidRequest("missing method".into())
        );
    }

    #[test]
    fn non_string_method_is_an_invalid_request() {
        assert_eq!(
            invalid(json!({"method": 7})),
            BridgeError::InvalidRequest("method must be a string, got integer".into())
        );
    }

    #[test]
    fn unknown_method_is_reported_by_name() {
        assert_eq!(
            invalid(json!({"method": "bogus_method"})),
            BridgeError::UnknownMethod("bogus_method".into())
        );
    }

    #[test]
    fn bars_require_symbol_and_integer_count() {
        let err = invalid(json!({"method": "get_m1_bars", "symbol": "EURUSD"}));
        assert_eq!(
            err,
            BridgeError::invalid_argument("get_m1_bars", "missing field `count`")
        );

        let err = invalid(json!({"method": "get_m1_bars", "symbol": "EURUSD", "count": 1.5}));
        assert!(matches!(err, BridgeError::InvalidArgument { ref method, .. } if method == "get_m1_bars"));

        let err = invalid(json!({"method": "get_m1_bars", "symbol": 3, "count": 1}));
        assert!(matches!(err, BridgeError::InvalidArgument { .. }));

        let err = invalid(json!({"method": "get_m1_bars", "symbol": "EURUSD", "count": 0}));
        assert!(matches!(err, BridgeError::InvalidArgument { .. }));
    }

    #[test]
    fn bars_plan_uses_m1_timeframe_from_position_zero() {
        let call =
            MethodCall::from_request(&json!({"method": "get_m1_bars", "symbol": "EURUSD", "count": 10}))
                .unwrap();
        assert_eq!(
            call.plan(),
            ForeignCall {
                entry: "copy_rates_from_pos",
                args: vec![
                    Arg::Doc(json!("EURUSD")),
                    Arg::Constant("TIMEFRAME_M1"),
                    Arg::Doc(json!(0)),
                    Arg::Doc(json!(10)),
                ],
            }
        );
    }

    #[test]
    fn integer_volume_is_accepted() {
        let call =
            MethodCall::from_request(&json!({"method": "open_market_buy", "symbol": "EURUSD", "volume": 1}))
                .unwrap();
        let MethodCall::OpenMarketBuy(order) = call else {
            panic!("expected a buy order");
        };
        assert_eq!(order.volume, 1.0);
    }

    #[test]
    fn non_positive_volume_is_rejected() {
        let err = invalid(json!({"method": "open_market_sell", "symbol": "EURUSD", "volume": -0.1}));
        assert_eq!(
            err,
            BridgeError::invalid_argument(
                "open_market_sell",
                "volume must be a positive number, got -0.1"
            )
        );
    }

    #[test]
    fn order_record_carries_side_and_optional_fields() {
        let call = MethodCall::from_request(&json!({
            "method": "open_market_sell",
            "symbol": "GBPUSD",
            "volume": 0.5,
            "deviation": 20,
            "comment": "hedge"
        }))
        .unwrap();
        assert_eq!(
            call.plan().args,
            vec![Arg::Doc(json!({
                "action": 1,
                "symbol": "GBPUSD",
                "volume": 0.5,
                "type": 1,
                "deviation": 20,
                "comment": "hedge"
            }))]
        );
    }

    #[test]
    fn empty_symbol_is_rejected() {
        let err = invalid(json!({"method": "symbol_info", "symbol": "  "}));
        assert_eq!(
            err,
            BridgeError::invalid_argument("symbol_info", "symbol must not be empty")
        );
    }

    #[test]
    fn argumentless_methods_ignore_extra_fields() {
        let call = MethodCall::from_request(&json!({"method": "terminal_info", "verbose": true})).unwrap();
        assert_eq!(call, MethodCall::TerminalInfo);
        assert_eq!(call.plan(), ForeignCall::bare("terminal_info"));
    }

    fn running(runtime: &ScriptedRuntime) {
        runtime
            .start(&RuntimeConfig {
                program_name: "mt5bridge",
                home: None,
            })
            .unwrap();
    }

    #[test]
    fn execute_releases_every_handle_on_success() {
        let runtime = ScriptedRuntime::metatrader();
        running(&runtime);
        let call = MethodCall::GetM1Bars {
            symbol: "EURUSD".into(),
            count: 1,
        };
        let out = runtime.with_lock(|s| execute(s, "MetaTrader5", &call.plan()));
        assert_eq!(out, Ok(Document::Null));
        assert_eq!(runtime.live_values(), 0);
        assert_eq!(runtime.calls()[0].args, vec![json!("EURUSD"), json!(1), json!(0), json!(1)]);
    }

    #[test]
    fn execute_releases_every_handle_when_a_constant_is_missing() {
        let runtime = ScriptedRuntime::new().with_module(
            crate::scripted::ScriptedModule::new("MetaTrader5")
                .function("copy_rates_from_pos", |_| Ok(Document::Null)),
        );
        running(&runtime);
        let call = MethodCall::GetM1Bars {
            symbol: "EURUSD".into(),
            count: 3,
        };
        let out = runtime.with_lock(|s| execute(s, "MetaTrader5", &call.plan()));
        assert_eq!(
            out,
            Err(BridgeError::ForeignRuntime(
                "module 'MetaTrader5' has no attribute 'TIMEFRAME_M1'".into()
            ))
        );
        assert_eq!(runtime.live_values(), 0);
        assert!(runtime.calls().is_empty());
    }

    #[test]
    fn execute_surfaces_vendor_exceptions() {
        let runtime = ScriptedRuntime::new().with_module(
            metatrader_module("MetaTrader5")
                .function("order_send", |_| Err("RuntimeError: trade disabled".to_string())),
        );
        running(&runtime);
        let call = MethodCall::from_request(&json!({"method": "open_market_buy", "symbol": "EURUSD", "volume": 0.1}))
            .unwrap();
        let out = runtime.with_lock(|s| execute(s, "MetaTrader5", &call.plan()));
        assert_eq!(
            out,
            Err(BridgeError::ForeignRuntime("RuntimeError: trade disabled".into()))
        );
        assert_eq!(runtime.live_values(), 0);
    }
}
