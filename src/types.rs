use std::fmt;

/// Role of an address inside the wallet: user deposit address, the operator
/// hot wallet, or the operator cold wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressType {
    User,
    Hot,
    Cold,
}

impl AddressType {
    /// SMALLINT encoding used in the `addresses` and `balances` tables.
    pub fn code(self) -> i16 {
        match self {
            AddressType::User => 0,
            AddressType::Hot => 1,
            AddressType::Cold => 2,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(AddressType::User),
            1 => Some(AddressType::Hot),
            2 => Some(AddressType::Cold),
            _ => None,
        }
    }
}

impl fmt::Display for AddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AddressType::User => "user",
            AddressType::Hot => "hot",
            AddressType::Cold => "cold",
        };
        write!(f, "{s}")
    }
}

/// Semantic classification of an engine-observed or engine-initiated transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxType {
    Deposit,
    Withdraw,
    Collect,
    HotToCold,
    ColdToHot,
}

impl TxType {
    pub fn code(self) -> i16 {
        match self {
            TxType::Deposit => 0,
            TxType::Withdraw => 1,
            TxType::Collect => 2,
            TxType::HotToCold => 3,
            TxType::ColdToHot => 4,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(TxType::Deposit),
            1 => Some(TxType::Withdraw),
            2 => Some(TxType::Collect),
            3 => Some(TxType::HotToCold),
            4 => Some(TxType::ColdToHot),
            _ => None,
        }
    }
}

impl fmt::Display for TxType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TxType::Deposit => "deposit",
            TxType::Withdraw => "withdraw",
            TxType::Collect => "collect",
            TxType::HotToCold => "hot_to_cold",
            TxType::ColdToHot => "cold_to_hot",
        };
        write!(f, "{s}")
    }
}

/// Deposit lifecycle. `Confirming` rows are promoted to `Credited` once their
/// block sinks `confirmations` below the processed tip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepositStatus {
    Confirming,
    Credited,
    Notified,
    Done,
}

impl DepositStatus {
    pub fn code(self) -> i16 {
        match self {
            DepositStatus::Confirming => 0,
            DepositStatus::Credited => 1,
            DepositStatus::Notified => 2,
            DepositStatus::Done => 3,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(DepositStatus::Confirming),
            1 => Some(DepositStatus::Credited),
            2 => Some(DepositStatus::Notified),
            3 => Some(DepositStatus::Done),
            _ => None,
        }
    }
}

/// Withdrawal lifecycle. The business layer inserts rows as `Unsigned`; the
/// withdraw pipeline moves them to `Broadcast`; the deposit pipeline moves
/// them to `OnChain` once the transfer is observed in a mined block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WithdrawStatus {
    Unsigned,
    Broadcast,
    OnChain,
    WalletDone,
    Notified,
    Success,
}

impl WithdrawStatus {
    pub fn code(self) -> i16 {
        match self {
            WithdrawStatus::Unsigned => 0,
            WithdrawStatus::Broadcast => 1,
            WithdrawStatus::OnChain => 2,
            WithdrawStatus::WalletDone => 3,
            WithdrawStatus::Notified => 4,
            WithdrawStatus::Success => 5,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(WithdrawStatus::Unsigned),
            1 => Some(WithdrawStatus::Broadcast),
            2 => Some(WithdrawStatus::OnChain),
            3 => Some(WithdrawStatus::WalletDone),
            4 => Some(WithdrawStatus::Notified),
            5 => Some(WithdrawStatus::Success),
            _ => None,
        }
    }
}

/// Transaction-table status: 0 while the transfer is confirming, 1 once it
/// has been observed on-chain and settled at the wallet layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Confirming,
    Settled,
}

impl TransactionStatus {
    pub fn code(self) -> i16 {
        match self {
            TransactionStatus::Confirming => 0,
            TransactionStatus::Settled => 1,
        }
    }
}
