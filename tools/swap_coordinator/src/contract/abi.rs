use alloy::sol;

sol! {
    /// Mirror of the on-chain swap record; `keccak256(abi.encode(swap))` is the swap id.
    #[derive(Debug, PartialEq, Eq)]
    struct Swap {
        address owner;
        address claimer;
        bytes32 pubKeyClaim;
        bytes32 pubKeyRefund;
        uint256 timeout0;
        uint256 timeout1;
        address asset;
        uint256 value;
        uint256 nonce;
    }

    #[sol(rpc)]
    interface ISwapCreator {
        function swaps(bytes32 swapID) external view returns (uint8);

        function newSwap(
            bytes32 pubKeyClaim,
            bytes32 pubKeyRefund,
            address claimer,
            uint256 timeout0,
            uint256 timeout1,
            address asset,
            uint256 value,
            uint256 nonce
        ) external payable returns (bytes32);

        function setReady(Swap memory swap) external;

        function claim(Swap memory swap, bytes32 secret) external;

        function claimRelayer(
            Swap memory swap,
            bytes32 secret,
            uint256 fee,
            bytes calldata signature
        ) external;

        function refund(Swap memory swap, bytes32 secret) external;

        event New(bytes32 indexed swapID, uint256 timeout0, uint256 timeout1, uint256 value);

        event Ready(bytes32 indexed swapID);

        event Claimed(bytes32 indexed swapID, bytes32 indexed s);

        event Refunded(bytes32 indexed swapID, bytes32 indexed s);
    }
}
