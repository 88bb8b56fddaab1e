use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;

use fumblechain_core::{pow, Block, BlockChain, ChainConfigBuilder, Transaction, DEFAULT_MAGIC};
use fumblechain_network::{Message, MessageCodec, Node};
use fumblechain_wallet::Wallet;

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind probe socket");
    listener.local_addr().expect("probe address").port()
}

fn mine(block: &mut Block) {
    block.proof = pow::find_proof(block);
}

fn start_node(chain: BlockChain, port: u16, peers: Vec<(String, u16)>) -> Arc<Node> {
    let dir = std::env::temp_dir();
    let path = dir.join(format!("fumblechain-test-{port}.json"));
    let node = Arc::new(Node::new(chain, port, 300, path));
    let runner = Arc::clone(&node);
    tokio::spawn(async move {
        let _ = runner.run(peers).await;
    });
    node
}

async fn raw_peer(port: u16) -> Framed<TcpStream, MessageCodec> {
    let socket = TcpStream::connect(("127.0.0.1", port))
        .await
        .expect("connect to node");
    Framed::new(socket, MessageCodec::new(DEFAULT_MAGIC, "raw-peer".into()))
}

/// Reads frames until one matches `pred`, failing after two seconds.
async fn expect_message<F>(framed: &mut Framed<TcpStream, MessageCodec>, mut pred: F) -> Message
where
    F: FnMut(&Message) -> bool,
{
    timeout(Duration::from_secs(2), async {
        loop {
            let frame = framed.next().await.expect("peer closed the connection");
            let (message, _id) = frame.expect("frame decodes");
            if pred(&message) {
                return message;
            }
        }
    })
    .await
    .expect("expected message within two seconds")
}

#[tokio::test]
async fn nodes_handshake_and_answer_pings() {
    let port = free_port();
    let node = start_node(BlockChain::default(), port, vec![]);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut peer = raw_peer(port).await;

    // both sides open with version; the node goes first on accept
    let version = expect_message(&mut peer, |m| matches!(m, Message::Version { .. })).await;
    match version {
        Message::Version { port: announced } => assert_eq!(announced, port),
        other => panic!("unexpected message {other:?}"),
    }

    peer.send(Message::Version { port: 9999 }).await.expect("send version");
    expect_message(&mut peer, |m| matches!(m, Message::Verack)).await;

    peer.send(Message::Verack).await.expect("send verack");
    expect_message(&mut peer, |m| matches!(m, Message::Getaddr)).await;

    peer.send(Message::Ping).await.expect("send ping");
    expect_message(&mut peer, |m| matches!(m, Message::Pong)).await;

    // we announced port 9999, so the node's peer table carries it
    let peers = node.manager().peers();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].address.1, 9999);
    assert!(!peers[0].client);
}

#[tokio::test]
async fn unknown_getblocks_hashes_are_rejected() {
    let port = free_port();
    let _node = start_node(BlockChain::default(), port, vec![]);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut peer = raw_peer(port).await;
    expect_message(&mut peer, |m| matches!(m, Message::Version { .. })).await;
    peer.send(Message::Version { port: 9999 }).await.expect("send version");
    expect_message(&mut peer, |m| matches!(m, Message::Verack)).await;

    peer.send(Message::Getblocks { topblockhash: 0x123 })
        .await
        .expect("send getblocks");
    let reject = expect_message(&mut peer, |m| matches!(m, Message::Reject { .. })).await;
    match reject {
        Message::Reject { block_hash } => assert_eq!(block_hash, 0x123),
        other => panic!("unexpected message {other:?}"),
    }
}

#[tokio::test]
async fn received_blocks_are_applied_and_rebroadcast() {
    let chain = BlockChain::default();
    let mut ours = chain.clone();

    let port = free_port();
    let node = start_node(chain, port, vec![]);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut peer = raw_peer(port).await;
    expect_message(&mut peer, |m| matches!(m, Message::Version { .. })).await;
    peer.send(Message::Version { port: 9998 }).await.expect("send version");
    expect_message(&mut peer, |m| matches!(m, Message::Verack)).await;

    // mine the next block on our copy of the same genesis
    let coinbase = Transaction::coinbase("miner", DEFAULT_MAGIC);
    let mut block = ours.new_block(Some(&coinbase));
    mine(&mut block);
    ours.discard_block(block.clone()).expect("our copy accepts");

    peer.send(Message::Block(Box::new(block.clone())))
        .await
        .expect("send block");
    tokio::time::sleep(Duration::from_millis(200)).await;
    node.manager().synchronize_blockchain();

    assert_eq!(node.manager().chain().tip().hash(), block.hash());

    // accepted blocks come back to every registered peer
    let echoed = expect_message(&mut peer, |m| matches!(m, Message::Block(_))).await;
    match echoed {
        Message::Block(b) => assert_eq!(b.hash(), block.hash()),
        other => panic!("unexpected message {other:?}"),
    }
}

#[tokio::test]
async fn far_ahead_blocks_trigger_a_catch_up() {
    let port = free_port();
    let node = start_node(BlockChain::default(), port, vec![]);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut peer = raw_peer(port).await;
    expect_message(&mut peer, |m| matches!(m, Message::Version { .. })).await;
    peer.send(Message::Version { port: 9997 }).await.expect("send version");
    expect_message(&mut peer, |m| matches!(m, Message::Verack)).await;

    // a block claiming height 5 on a length-1 chain cannot attach
    let mut stray = Block::new(5, 0xfeed);
    stray.add_transaction(&Transaction::coinbase("miner", DEFAULT_MAGIC));
    mine(&mut stray);
    peer.send(Message::Block(Box::new(stray))).await.expect("send block");
    tokio::time::sleep(Duration::from_millis(200)).await;
    node.manager().synchronize_blockchain();

    let tip_hash = node.manager().chain().tip().hash();
    let getblocks = expect_message(&mut peer, |m| matches!(m, Message::Getblocks { .. })).await;
    match getblocks {
        Message::Getblocks { topblockhash } => assert_eq!(topblockhash, tip_hash),
        other => panic!("unexpected message {other:?}"),
    }
}

#[tokio::test]
async fn pending_transactions_reach_the_pool() {
    // the sender needs spendable funds: make it a CTF wallet
    let wallet = Wallet::generate().expect("wallet");
    let address = wallet.address().expect("address");
    let cfg = ChainConfigBuilder::new()
        .magic(DEFAULT_MAGIC)
        .ctf_wallets([address.clone()])
        .finish();
    let chain = BlockChain::new(cfg);

    let port = free_port();
    let node = start_node(chain, port, vec![]);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut peer = raw_peer(port).await;
    expect_message(&mut peer, |m| matches!(m, Message::Version { .. })).await;
    peer.send(Message::Version { port: 9996 }).await.expect("send version");
    expect_message(&mut peer, |m| matches!(m, Message::Verack)).await;

    let mut tx = Transaction::new(&address, "merchant", 2.5, DEFAULT_MAGIC);
    tx.sign(&wallet).expect("sign");
    peer.send(Message::Tx(tx.clone())).await.expect("send tx");
    tokio::time::sleep(Duration::from_millis(200)).await;
    node.manager().synchronize_blockchain();

    let manager = node.manager();
    let chain = manager.chain();
    assert_eq!(chain.transaction_pool.len(), 1);
    assert_eq!(
        chain.transaction_pool.iter().next().map(|t| t.index.clone()),
        Some(tx.index)
    );
}

#[tokio::test]
async fn broadcast_blocks_spread_between_nodes() {
    // both nodes start from the same genesis
    let genesis_chain = BlockChain::default();

    let port_a = free_port();
    let node_a = start_node(genesis_chain.clone(), port_a, vec![]);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let port_b = free_port();
    let node_b = start_node(genesis_chain, port_b, vec![("127.0.0.1".into(), port_a)]);

    // wait for the handshake to register both peer tables
    timeout(Duration::from_secs(5), async {
        while node_a.manager().peers().is_empty() || node_b.manager().peers().is_empty() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("nodes handshake");

    // node A accepts a freshly mined block and broadcasts it, the way the
    // client API does
    let coinbase = Transaction::coinbase("miner", DEFAULT_MAGIC);
    let mut block = node_a.manager().chain().new_block(Some(&coinbase));
    mine(&mut block);
    node_a
        .manager()
        .chain_mut()
        .discard_block(block.clone())
        .expect("node a accepts");
    node_a.manager().broadcast_block(&block);

    // node B picks it off its block queue
    timeout(Duration::from_secs(5), async {
        loop {
            node_b.manager().synchronize_blockchain();
            if node_b.manager().chain().chain.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("node b applies the broadcast block");

    assert_eq!(
        node_b.manager().chain().tip().hash(),
        node_a.manager().chain().tip().hash()
    );
}
