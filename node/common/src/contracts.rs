use ethers::{
    contract::{abigen, parse_log, EthEvent},
    middleware::SignerMiddleware,
    providers::{Http, Provider},
    signers::LocalWallet,
    types::TransactionReceipt,
};

// Generate contract bindings
abigen!(
    AgentRegistry,
    r#"[
        function registerAgent(string did, string metadataURI) external
        function isRegistered(address agent) external view returns (bool)
        event AgentRegistered(address indexed agent, string did, string metadataURI)
    ]"#
);

abigen!(
    ServiceMarketplace,
    r#"[
        function listService(string serviceType, uint256 pricePerUnit, string metadataURI) external returns (uint256)
        function createOrder(uint256 serviceId, uint256 units, uint64 deadline) external payable returns (uint256)
        function completeOrder(uint256 orderId, string resultURI, bytes32 resultHash) external
        function disputeOrder(uint256 orderId, string reason) external
        function resolveDispute(uint256 orderId, bool refundBuyer) external
        function cancelOrder(uint256 orderId) external
        function openStream(address payee, uint256 ratePerSecond) external payable returns (uint256)
        function claimStream(uint256 streamId) external returns (uint256)
        function stopStream(uint256 streamId) external
        event ServiceListed(uint256 indexed serviceId, address indexed provider, string serviceType, uint256 pricePerUnit)
        event OrderCreated(uint256 indexed orderId, uint256 indexed serviceId, address indexed buyer, address seller, uint256 totalPrice, bytes32 inputHash, uint64 deadline)
        event OrderCompleted(uint256 indexed orderId, string resultURI, bytes32 resultHash)
        event OrderCancelled(uint256 indexed orderId)
        event OrderDisputed(uint256 indexed orderId, string reason)
        event DisputeResolved(uint256 indexed orderId, bool refundBuyer)
        event StreamOpened(uint256 indexed streamId, address indexed payer, address indexed payee, uint256 ratePerSecond, uint256 deposit)
        event StreamClaimed(uint256 indexed streamId, uint256 amount)
        event StreamStopped(uint256 indexed streamId, uint256 refunded)
    ]"#
);

abigen!(
    CrossDomainBridge,
    r#"[
        function balanceOf(address account) external view returns (uint256)
        function withdraw(uint256 amount, address recipient) external
        event WithdrawalInitiated(address indexed from, address indexed recipient, uint256 amount, uint256 withdrawalId)
    ]"#
);

pub type Client = SignerMiddleware<Provider<Http>, LocalWallet>;

/// First log in `receipt` carrying `E`'s signature that decodes as `E`.
/// Logs from other events are skipped.
pub fn find_event<E: EthEvent>(receipt: &TransactionReceipt) -> Option<E> {
    let signature = E::signature();
    receipt
        .logs
        .iter()
        .filter(|log| log.topics.first() == Some(&signature))
        .find_map(|log| parse_log::<E>(log.clone()).ok())
}
