//! Remote oracle access.
//!
//! `OracleTransport` is the only door to the chain. The production
//! implementation talks JSON-RPC over HTTP through alloy; tests use an
//! in-memory mock. Errors leave this module already classified.

use crate::oracle::abi::{self, IPropertyValuationOracle};
use crate::oracle::error::{
    classify_contract_error, classify_pending_error, classify_rpc_error, TransportError,
};
use crate::oracle::types::{PropertyId, ValuationRequest};
use alloy::eips::BlockNumberOrTag;
use alloy::network::{EthereumWallet, ReceiptResponse};
use alloy::primitives::{Address, B256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::{Filter, Log};
use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;
use tracing::{debug, info};

/// A mined request transaction.
#[derive(Debug, Clone)]
pub struct SentTransaction {
    pub tx_hash: B256,
    pub block_number: Option<u64>,
    pub logs: Vec<Log>,
}

#[async_trait]
pub trait OracleTransport: Send + Sync + 'static {
    fn oracle_address(&self) -> Address;

    /// Connected wallet, if any.
    fn wallet(&self) -> Option<Address>;

    async fn block_number(&self) -> Result<u64, TransportError>;

    /// Raw oracle logs in `[from_block, to_block]`, filtered on the oracle address and event topics.
    async fn get_logs(&self, from_block: u64, to_block: u64) -> Result<Vec<Log>, TransportError>;

    /// Block timestamp in seconds, `None` if the node does not know the block.
    async fn block_timestamp(&self, block_number: u64) -> Result<Option<u64>, TransportError>;

    async fn can_user_request(
        &self,
        user: Address,
        property_id: PropertyId,
    ) -> Result<bool, TransportError>;

    /// Remote `lastRequestTime(propertyId)`, seconds.
    async fn last_request_time(&self, property_id: PropertyId) -> Result<u64, TransportError>;

    /// Send `requestValuationUpdate` (or the keyed variant) and wait for the receipt.
    async fn request_valuation_update(
        &self,
        request: &ValuationRequest,
    ) -> Result<SentTransaction, TransportError>;
}

/// JSON-RPC transport backed by an alloy HTTP provider.
pub struct AlloyTransport {
    provider: DynProvider,
    address: Address,
    wallet: Option<Address>,
}

impl AlloyTransport {
    /// Connect over HTTP. With a private key, transactions are signed locally.
    pub fn connect_http(
        url: &str,
        address: Address,
        private_key: Option<&str>,
    ) -> Result<Self, TransportError> {
        let url: alloy::transports::http::reqwest::Url = url
            .parse()
            .map_err(|e| TransportError::Connection(format!("invalid rpc url {url}: {e}")))?;

        let (provider, wallet) = match private_key {
            Some(key) => {
                let signer: PrivateKeySigner = key
                    .trim()
                    .parse()
                    .map_err(|_| TransportError::Decode("invalid private key".to_string()))?;
                let wallet = signer.address();
                let provider = ProviderBuilder::new()
                    .wallet(EthereumWallet::from(signer))
                    .connect_http(url)
                    .erased();
                (provider, Some(wallet))
            }
            None => (ProviderBuilder::new().connect_http(url).erased(), None),
        };

        info!(oracle = %address, wallet = ?wallet, "oracle transport ready");
        Ok(Self {
            provider,
            address,
            wallet,
        })
    }

    fn contract(&self) -> IPropertyValuationOracle::IPropertyValuationOracleInstance<DynProvider> {
        IPropertyValuationOracle::new(self.address, self.provider.clone())
    }
}

#[async_trait]
impl OracleTransport for AlloyTransport {
    fn oracle_address(&self) -> Address {
        self.address
    }

    fn wallet(&self) -> Option<Address> {
        self.wallet
    }

    async fn block_number(&self) -> Result<u64, TransportError> {
        self.provider
            .get_block_number()
            .await
            .map_err(|e| classify_rpc_error(&e))
    }

    async fn get_logs(&self, from_block: u64, to_block: u64) -> Result<Vec<Log>, TransportError> {
        let filter = Filter::new()
            .address(self.address)
            .event_signature(abi::event_topics())
            .from_block(from_block)
            .to_block(to_block);
        self.provider
            .get_logs(&filter)
            .await
            .map_err(|e| classify_rpc_error(&e))
    }

    async fn block_timestamp(&self, block_number: u64) -> Result<Option<u64>, TransportError> {
        let block = self
            .provider
            .get_block_by_number(BlockNumberOrTag::Number(block_number))
            .await
            .map_err(|e| classify_rpc_error(&e))?;
        Ok(block.map(|b| b.header.timestamp))
    }

    async fn can_user_request(
        &self,
        user: Address,
        property_id: PropertyId,
    ) -> Result<bool, TransportError> {
        self.contract()
            .canUserRequestValuation(user, property_id)
            .call()
            .await
            .map_err(|e| classify_contract_error(&e))
    }

    async fn last_request_time(&self, property_id: PropertyId) -> Result<u64, TransportError> {
        let ts = self
            .contract()
            .lastRequestTime(property_id)
            .call()
            .await
            .map_err(|e| classify_contract_error(&e))?;
        Ok(u64::try_from(ts).unwrap_or(u64::MAX))
    }

    async fn request_valuation_update(
        &self,
        request: &ValuationRequest,
    ) -> Result<SentTransaction, TransportError> {
        if self.wallet.is_none() {
            return Err(TransportError::Connection("no wallet configured".to_string()));
        }

        let oracle = self.contract();
        let pending = match &request.api_key {
            Some(key) => {
                oracle
                    .requestValuationUpdateWithKey(
                        request.property_id,
                        request.location.clone(),
                        request.size,
                        key.clone(),
                    )
                    .send()
                    .await
            }
            None => {
                oracle
                    .requestValuationUpdate(
                        request.property_id,
                        request.location.clone(),
                        request.size,
                    )
                    .send()
                    .await
            }
        }
        .map_err(|e| classify_contract_error(&e))?;

        debug!(tx = %pending.tx_hash(), property = %request.property_id, "valuation request sent");

        let receipt = pending
            .get_receipt()
            .await
            .map_err(|e| classify_pending_error(&e))?;

        if !receipt.status() {
            return Err(TransportError::Reverted { reason: None });
        }

        Ok(SentTransaction {
            tx_hash: receipt.transaction_hash,
            block_number: receipt.block_number,
            logs: receipt.inner.logs().to_vec(),
        })
    }
}
