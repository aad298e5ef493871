pub mod uniswap_v3;
