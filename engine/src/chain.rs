use std::{fmt, str::FromStr};

/// The network a multistream is bound to. Every multistream serves exactly
/// one chain; events tagged with any other chain are ignored.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Chain {
	Ethereum,
	EthereumSepolia,
	Bitcoin,
}

impl Chain {
	pub fn id(&self) -> u16 {
		match self {
			Chain::Ethereum => 100,
			Chain::EthereumSepolia => 10005,
			Chain::Bitcoin => 1,
		}
	}

	/// Stable code used in metrics labels and in the aggregated upstream id
	/// `!all:<code>`.
	pub fn code(&self) -> &'static str {
		match self {
			Chain::Ethereum => "ETH",
			Chain::EthereumSepolia => "SEPOLIA",
			Chain::Bitcoin => "BTC",
		}
	}
}

impl fmt::Display for Chain {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.code())
	}
}

impl FromStr for Chain {
	type Err = anyhow::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_uppercase().as_str() {
			"ETH" | "ETHEREUM" => Ok(Chain::Ethereum),
			"SEPOLIA" | "ETHEREUM-SEPOLIA" => Ok(Chain::EthereumSepolia),
			"BTC" | "BITCOIN" => Ok(Chain::Bitcoin),
			unknown => Err(anyhow::anyhow!("unknown chain code: {unknown}")),
		}
	}
}
