//! Pending transaction pool.

use crate::block::Block;
use crate::error::{Error, Result};
use crate::transaction::Transaction;

/// Validated transactions waiting to be mined into a block.
///
/// The pool stays sorted by ascending quantity, so pulling always yields
/// the most valuable pending transaction.
#[derive(Debug, Clone, Default)]
pub struct TransactionPool {
    txs: Vec<Transaction>,
}

impl TransactionPool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the given transaction to this pool.
    ///
    /// The transaction must carry a valid signature and an index not
    /// already present in the pool.
    pub fn add_transaction(&mut self, tx: Transaction) -> Result<()> {
        if !tx.verify() {
            return Err(Error::BadSignature);
        }
        if self.txs.iter().any(|t| t.index == tx.index) {
            return Err(Error::DuplicateTransaction);
        }
        self.txs.push(tx);
        self.txs.sort_by(|a, b| a.qty.total_cmp(&b.qty));
        Ok(())
    }

    /// Removes and returns the pending transaction with the highest
    /// quantity, or `None` if the pool is empty.
    pub fn pull_transaction(&mut self) -> Option<Transaction> {
        self.txs.pop()
    }

    /// Inserts all the transactions of `block` into this pool.
    ///
    /// Returns false as soon as one insertion is refused; earlier
    /// transactions stay in the pool.
    pub fn import_transactions(&mut self, block: &Block) -> bool {
        for tx in block.transactions() {
            if self.add_transaction(tx.clone()).is_err() {
                return false;
            }
        }
        true
    }

    /// Removes every pool entry with the same index as `tx`.
    pub fn remove_transaction(&mut self, tx: &Transaction) {
        self.txs.retain(|t| t.index != tx.index);
    }

    /// Iterates the pending transactions in ascending quantity order.
    pub fn iter(&self) -> impl Iterator<Item = &Transaction> {
        self.txs.iter()
    }

    /// Returns the number of pending transactions.
    pub fn len(&self) -> usize {
        self.txs.len()
    }

    /// Returns true if no transaction is pending.
    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::DEFAULT_MAGIC;
    use fumblechain_wallet::Wallet;

    fn signed(wallet: &Wallet, qty: f64) -> Transaction {
        let mut tx = Transaction::new(
            wallet.address().expect("address"),
            "dst",
            qty,
            DEFAULT_MAGIC,
        );
        tx.sign(wallet).expect("sign");
        tx
    }

    #[test]
    fn unsigned_transactions_are_refused() {
        let mut pool = TransactionPool::new();
        let tx = Transaction::new("a", "b", 1.0, DEFAULT_MAGIC);
        assert!(matches!(pool.add_transaction(tx), Err(Error::BadSignature)));
        assert!(pool.is_empty());
    }

    #[test]
    fn duplicate_indexes_are_refused() {
        let wallet = Wallet::generate().expect("wallet");
        let mut pool = TransactionPool::new();
        let tx = signed(&wallet, 1.0);
        pool.add_transaction(tx.clone()).expect("first insert");
        assert!(matches!(
            pool.add_transaction(tx),
            Err(Error::DuplicateTransaction)
        ));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn pool_stays_sorted_and_pulls_largest() {
        let wallet = Wallet::generate().expect("wallet");
        let mut pool = TransactionPool::new();
        for qty in [0.5, 3.0, 1.25] {
            pool.add_transaction(signed(&wallet, qty)).expect("insert");
        }
        let quantities: Vec<f64> = pool.iter().map(|t| t.qty).collect();
        assert_eq!(quantities, vec![0.5, 1.25, 3.0]);

        assert_eq!(pool.pull_transaction().map(|t| t.qty), Some(3.0));
        assert_eq!(pool.pull_transaction().map(|t| t.qty), Some(1.25));
        assert_eq!(pool.pull_transaction().map(|t| t.qty), Some(0.5));
        assert!(pool.pull_transaction().is_none());
    }

    #[test]
    fn remove_transaction_matches_by_index() {
        let wallet = Wallet::generate().expect("wallet");
        let mut pool = TransactionPool::new();
        let keep = signed(&wallet, 1.0);
        let gone = signed(&wallet, 2.0);
        pool.add_transaction(keep.clone()).expect("insert");
        pool.add_transaction(gone.clone()).expect("insert");

        pool.remove_transaction(&gone);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.iter().next().map(|t| t.index.clone()), Some(keep.index));
    }
}
